//! Suite resolution
//!
//! Turns vendor/suite names from the configuration into immutable [`Suite`]
//! values whose parent chain is fully resolved. Chains are walked once, at
//! resolution time, so a cyclic `base` entry is reported before anything is
//! built.

use crate::config::schema::{Config, SuiteConfig, VendorConfig};
use crate::error::{VectisError, VectisResult};
use std::fmt;
use std::sync::Arc;

/// Marker for "use the vendor's canonical archive"
pub const DIRECT_MIRROR: &str = "direct";

/// A resolved, buildable target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suite {
    /// Distribution vendor (debian, ubuntu, ...)
    pub vendor: String,
    /// Suite name (sid, bookworm-backports, ...)
    pub name: String,
    /// Debian architecture name
    pub architecture: String,
    /// Suite this one is derived from
    pub parent: Option<Arc<Suite>>,
    /// Resolved mirror URL
    pub mirror: String,
    /// Archive components to enable
    pub components: Vec<String>,
    /// Name written into apt sources
    pub apt_suite: String,
    /// Kernel package for bootstrapped images
    pub kernel_package: Option<String>,
}

impl Suite {
    /// This suite followed by each ancestor, nearest first
    pub fn hierarchy(&self) -> impl Iterator<Item = &Suite> {
        std::iter::successors(Some(self), |s| s.parent.as_deref())
    }

    /// The ancestor with no parent
    pub fn root(&self) -> &Suite {
        self.hierarchy().last().unwrap_or(self)
    }

    /// `vendor/name/architecture`, for messages
    pub fn label(&self) -> String {
        format!("{}/{}/{}", self.vendor, self.name, self.architecture)
    }

    /// apt sources.list lines for the whole chain
    pub fn sources_list(&self) -> String {
        let mut out = String::new();
        for ancestor in self.hierarchy() {
            for kind in ["deb", "deb-src"] {
                out.push_str(&format!(
                    "{} {} {} {}\n",
                    kind,
                    ancestor.mirror,
                    ancestor.apt_suite,
                    ancestor.components.join(" ")
                ));
            }
        }
        out
    }
}

impl fmt::Display for Suite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl Config {
    /// Look up a vendor definition
    pub fn vendor(&self, vendor: &str) -> VectisResult<&VendorConfig> {
        self.vendors.get(vendor).ok_or_else(|| VectisError::SuiteNotFound {
            vendor: vendor.to_string(),
            suite: "*".to_string(),
        })
    }

    /// Resolve a suite and its whole parent chain
    pub fn resolve_suite(
        &self,
        vendor: &str,
        name: &str,
        architecture: &str,
    ) -> VectisResult<Arc<Suite>> {
        let vendor_config = self.vendor(vendor)?;

        // Collect the chain root-last, detecting cycles on the way
        let mut chain: Vec<(String, SuiteConfig)> = Vec::new();
        let mut current = Some(name.to_string());

        while let Some(suite_name) = current {
            if chain.iter().any(|(seen, _)| *seen == suite_name) {
                let mut names: Vec<&str> = chain.iter().map(|(n, _)| n.as_str()).collect();
                names.push(&suite_name);
                return Err(VectisError::SuiteCycle {
                    vendor: vendor.to_string(),
                    suite: name.to_string(),
                    chain: names.join(" -> "),
                });
            }

            let suite_config = lookup_suite(vendor_config, &suite_name).ok_or_else(|| {
                VectisError::SuiteNotFound {
                    vendor: vendor.to_string(),
                    suite: suite_name.clone(),
                }
            })?;
            current = suite_config.base.clone();
            chain.push((suite_name, suite_config));
        }

        let mut parent: Option<Arc<Suite>> = None;
        for (suite_name, suite_config) in chain.into_iter().rev() {
            let mirror = resolve_mirror(vendor, vendor_config, &suite_name, &suite_config)?;
            let suite = Suite {
                vendor: vendor.to_string(),
                apt_suite: suite_config
                    .apt_suite
                    .clone()
                    .unwrap_or_else(|| suite_name.clone()),
                name: suite_name,
                architecture: architecture.to_string(),
                parent: parent.take(),
                mirror,
                components: suite_config
                    .components
                    .clone()
                    .unwrap_or_else(|| vendor_config.components.clone()),
                kernel_package: vendor_config.kernel_package.clone(),
            };
            parent = Some(Arc::new(suite));
        }

        parent.ok_or_else(|| VectisError::Internal(format!("empty suite chain for {}", name)))
    }

    /// Check every configured suite chain
    ///
    /// Wildcard entries are skipped; they are checked whenever a concrete
    /// suite matches them.
    pub fn validate_suites(&self) -> VectisResult<()> {
        for (vendor, vendor_config) in &self.vendors {
            for (name, _) in vendor_config.suites.iter().filter(|(n, _)| !n.contains('*')) {
                self.resolve_suite(vendor, name, "all")?;
            }
        }
        Ok(())
    }
}

/// Find a suite entry, falling back to `*-suffix` wildcards
fn lookup_suite(vendor: &VendorConfig, name: &str) -> Option<SuiteConfig> {
    if let Some(found) = vendor.suites.get(name) {
        return Some(found.clone());
    }

    vendor
        .suites
        .iter()
        .filter_map(|(pattern, config)| {
            let suffix = pattern.strip_prefix('*')?;
            let prefix = name.strip_suffix(suffix)?;
            (!prefix.is_empty()).then(|| (prefix, config))
        })
        .map(|(prefix, config)| {
            let mut config = config.clone();
            config.base = config.base.map(|b| b.replace('*', prefix));
            config.apt_suite = config.apt_suite.map(|s| s.replace('*', prefix));
            config
        })
        .next()
}

fn resolve_mirror(
    vendor: &str,
    vendor_config: &VendorConfig,
    suite: &str,
    suite_config: &SuiteConfig,
) -> VectisResult<String> {
    let configured = suite_config
        .mirror
        .as_deref()
        .or(vendor_config.mirror.as_deref())
        .unwrap_or(DIRECT_MIRROR);

    if configured != DIRECT_MIRROR {
        return Ok(configured.to_string());
    }

    vendor_config
        .archive_uri
        .clone()
        .ok_or_else(|| VectisError::NoMirror(format!("{}/{}", vendor, suite)))
}
