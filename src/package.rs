//! Debian source and binary package inputs

use crate::error::{VectisError, VectisResult};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Names listed in the `Files:` field of a `.dsc` or `.changes` file
///
/// Continuation lines are `md5 size name` in a `.dsc` and
/// `md5 size section priority name` in a `.changes`; the name is always
/// the last word.
pub fn parse_listed_files(control: &str) -> Vec<String> {
    let mut files = Vec::new();
    let mut in_files = false;

    for line in control.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if in_files {
                if let Some(name) = line.split_whitespace().last() {
                    files.push(name.to_string());
                }
            }
            continue;
        }
        in_files = line
            .split_once(':')
            .is_some_and(|(field, _)| field.eq_ignore_ascii_case("files"));
    }

    files
}

/// Wildcards in the `Architecture:` field of a `.dsc`
pub fn parse_architectures(control: &str) -> Vec<String> {
    control
        .lines()
        .filter(|line| !line.starts_with(' ') && !line.starts_with('\t'))
        .find_map(|line| {
            let (field, value) = line.split_once(':')?;
            field
                .eq_ignore_ascii_case("architecture")
                .then(|| value.split_whitespace().map(str::to_string).collect())
        })
        .unwrap_or_default()
}

/// Split a Debian architecture into `(os, cpu)`; bare names are Linux
fn arch_tuple(arch: &str) -> (&str, &str) {
    arch.split_once('-').unwrap_or(("linux", arch))
}

/// Whether `arch` satisfies an `Architecture:` wildcard
///
/// Covers `any`, `all`, exact names and `os-cpu` pairs where either half
/// may be `any` (`linux-any`, `any-amd64`).
pub fn arch_matches(wildcard: &str, arch: &str) -> bool {
    match wildcard {
        "all" => false,
        "any" => true,
        _ if wildcard == arch => true,
        _ => {
            let (os, cpu) = arch_tuple(arch);
            match wildcard.split_once('-') {
                Some((w_os, w_cpu)) => {
                    (w_os == "any" || w_os == os) && (w_cpu == "any" || w_cpu == cpu)
                }
                None => false,
            }
        }
    }
}

/// Whether a source package has architecture-independent binaries, and
/// whether it builds architecture-specific binaries natively on `arch`
pub fn build_halves(architectures: &[String], arch: &str) -> (bool, bool) {
    let indep = architectures.iter().any(|a| a == "all");
    let native = architectures.iter().any(|a| arch_matches(a, arch));
    (indep, native)
}

/// Read a `.dsc` and return its architecture wildcards
pub async fn architectures(path: &Path) -> VectisResult<Vec<String>> {
    let text = fs::read_to_string(path)
        .await
        .map_err(|e| VectisError::io(format!("reading {}", path.display()), e))?;
    Ok(parse_architectures(&text))
}

/// Read a `.dsc` or `.changes` file and list the files it refers to
pub async fn listed_files(path: &Path) -> VectisResult<Vec<String>> {
    let text = fs::read_to_string(path)
        .await
        .map_err(|e| VectisError::io(format!("reading {}", path.display()), e))?;
    Ok(parse_listed_files(&text))
}

/// Directory a control file's listed files are relative to
pub fn sibling_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

/// Final path component as a string
pub fn file_name(path: &Path) -> VectisResult<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| VectisError::User(format!("{} has no file name", path.display())))
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().is_some_and(|e| e == ext)
}

/// One autopkgtest run: a source package and/or the binaries to test
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestSubject {
    pub source: Option<PathBuf>,
    pub binaries: Vec<PathBuf>,
}

/// Group command-line files into test subjects
///
/// Each `.dsc` starts a new subject; `.deb` and `.changes` files attach to
/// the subject before them.
pub fn group_test_subjects(files: &[PathBuf]) -> VectisResult<Vec<TestSubject>> {
    let mut subjects: Vec<TestSubject> = Vec::new();

    for file in files {
        if has_extension(file, "dsc") {
            subjects.push(TestSubject {
                source: Some(file.clone()),
                binaries: Vec::new(),
            });
        } else if has_extension(file, "deb") || has_extension(file, "changes") {
            match subjects.last_mut() {
                Some(subject) => subject.binaries.push(file.clone()),
                None => subjects.push(TestSubject {
                    source: None,
                    binaries: vec![file.clone()],
                }),
            }
        } else {
            return Err(VectisError::User(format!(
                "{}: expected a .dsc, .deb or .changes file",
                file.display()
            )));
        }
    }

    Ok(subjects)
}

/// A binary package for piuparts: a local `.deb` or a name apt resolves
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryPackage {
    Deb(PathBuf),
    Named(String),
}

impl BinaryPackage {
    /// Package name, or the `.deb` file name without its extension
    pub fn label(&self) -> String {
        match self {
            BinaryPackage::Deb(path) => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            BinaryPackage::Named(name) => name.clone(),
        }
    }
}

/// Resolve piuparts arguments into binary packages
///
/// Existing `.deb` files are used as they are, existing `.changes` files
/// contribute every `.deb` they list, and anything that is not a file is
/// taken as a package name for apt.
pub async fn binary_packages(things: &[String]) -> VectisResult<Vec<BinaryPackage>> {
    let mut packages = Vec::new();

    for thing in things {
        let path = Path::new(thing);
        if !fs::try_exists(path).await.unwrap_or(false) {
            packages.push(BinaryPackage::Named(thing.clone()));
        } else if has_extension(path, "deb") {
            packages.push(BinaryPackage::Deb(path.to_path_buf()));
        } else if has_extension(path, "changes") {
            let from = sibling_dir(path);
            packages.extend(
                listed_files(path)
                    .await?
                    .into_iter()
                    .filter(|name| name.ends_with(".deb"))
                    .map(|name| BinaryPackage::Deb(from.join(name))),
            );
        } else {
            return Err(VectisError::User(format!(
                "{}: expected a .deb or .changes file, or a package name",
                thing
            )));
        }
    }

    Ok(packages)
}

/// Source packages to build; every path must be a `.dsc`
pub fn source_packages(files: &[PathBuf]) -> VectisResult<Vec<PathBuf>> {
    files
        .iter()
        .map(|f| {
            if has_extension(f, "dsc") {
                Ok(f.clone())
            } else {
                Err(VectisError::User(format!(
                    "{}: expected a .dsc source package",
                    f.display()
                )))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DSC: &str = "\
Format: 3.0 (quilt)
Source: hello
Architecture: any all
Version: 2.10-3
Checksums-Sha256:
 abc 1000 hello_2.10.orig.tar.gz
Files:
 d41d8cd98f00b204e9800998ecf8427e 1000 hello_2.10.orig.tar.gz
 d41d8cd98f00b204e9800998ecf8427e 200 hello_2.10-3.debian.tar.xz
";

    const CHANGES: &str = "\
Source: hello
Files:
 0123 5000 devel optional hello_2.10-3_amd64.deb
 4567 900 debug optional hello-dbgsym_2.10-3_amd64.deb
";

    #[test]
    fn dsc_files_field() {
        assert_eq!(
            parse_listed_files(DSC),
            vec!["hello_2.10.orig.tar.gz", "hello_2.10-3.debian.tar.xz"]
        );
    }

    #[test]
    fn changes_files_field() {
        assert_eq!(
            parse_listed_files(CHANGES),
            vec!["hello_2.10-3_amd64.deb", "hello-dbgsym_2.10-3_amd64.deb"]
        );
    }

    #[test]
    fn sibling_dir_of_bare_name() {
        assert_eq!(sibling_dir(Path::new("hello.dsc")), Path::new("."));
        assert_eq!(sibling_dir(Path::new("/src/hello.dsc")), Path::new("/src"));
    }

    #[test]
    fn grouping_test_subjects() {
        let files: Vec<PathBuf> = ["a.deb", "b.dsc", "b1.deb", "b.changes", "c.dsc"]
            .iter()
            .map(PathBuf::from)
            .collect();
        let subjects = group_test_subjects(&files).unwrap();
        assert_eq!(subjects.len(), 3);
        assert_eq!(subjects[0].source, None);
        assert_eq!(subjects[1].binaries.len(), 2);
        assert!(subjects[2].binaries.is_empty());
    }

    #[test]
    fn rejects_unknown_files() {
        let files = vec![PathBuf::from("notes.txt")];
        assert!(group_test_subjects(&files).is_err());
        assert!(source_packages(&files).is_err());
    }

    #[tokio::test]
    async fn piuparts_packages_from_files_and_names() {
        let temp = tempfile::TempDir::new().unwrap();
        let changes = temp.path().join("hello_2.10-3_amd64.changes");
        std::fs::write(&changes, format!("{} 1 misc optional hello_2.10-3.dsc\n", CHANGES)).unwrap();
        let deb = temp.path().join("extra_1_all.deb");
        std::fs::write(&deb, b"!<arch>").unwrap();

        let things = [
            changes.display().to_string(),
            deb.display().to_string(),
            "coreutils".to_string(),
        ];
        let packages = binary_packages(&things).await.unwrap();
        assert_eq!(
            packages,
            vec![
                BinaryPackage::Deb(temp.path().join("hello_2.10-3_amd64.deb")),
                BinaryPackage::Deb(temp.path().join("hello-dbgsym_2.10-3_amd64.deb")),
                BinaryPackage::Deb(deb),
                BinaryPackage::Named("coreutils".to_string()),
            ]
        );
        assert_eq!(packages[0].label(), "hello_2.10-3_amd64");
        assert_eq!(packages[3].label(), "coreutils");

        let notes = temp.path().join("notes.txt");
        std::fs::write(&notes, b"x").unwrap();
        assert!(binary_packages(&[notes.display().to_string()]).await.is_err());
    }

    #[test]
    fn dsc_architectures() {
        assert_eq!(parse_architectures(DSC), vec!["any", "all"]);
        assert_eq!(build_halves(&parse_architectures(DSC), "amd64"), (true, true));
        assert_eq!(build_halves(&["all".to_string()], "amd64"), (true, false));
        assert_eq!(build_halves(&["linux-any".to_string()], "arm64"), (false, true));
        assert_eq!(
            build_halves(&["hurd-any".to_string(), "all".to_string()], "amd64"),
            (true, false)
        );
        assert!(parse_architectures(CHANGES).is_empty());
    }

    #[test]
    fn architecture_wildcards() {
        assert!(arch_matches("any", "hurd-i386"));
        assert!(arch_matches("amd64", "amd64"));
        assert!(arch_matches("linux-any", "armhf"));
        assert!(arch_matches("any-amd64", "amd64"));
        assert!(arch_matches("any-amd64", "kfreebsd-amd64"));
        assert!(arch_matches("kfreebsd-any", "kfreebsd-amd64"));
        assert!(!arch_matches("linux-any", "hurd-i386"));
        assert!(!arch_matches("any-i386", "amd64"));
        assert!(!arch_matches("i386", "amd64"));
        assert!(!arch_matches("all", "amd64"));
    }
}
