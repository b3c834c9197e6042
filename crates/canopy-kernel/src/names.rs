//! Platform name validation.
//!
//! Whether a segment is a legal resource name depends on the host file
//! system. The kernel only asks a [`NameValidator`]; [`PlatformNameRules`]
//! is the built-in table.

use std::fmt::Debug;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Host platform hint passed to name validation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Platform {
    Windows,
    Unix,
    Macos,
}

impl Platform {
    /// The platform this binary was built for.
    pub fn host() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::Macos
        } else {
            Platform::Unix
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::host()
    }
}

/// Decides whether a single path segment may name a resource.
pub trait NameValidator: Send + Sync + Debug {
    /// `Err(reason)` when `name` is not legal on `platform`.
    fn check(&self, name: &str, platform: Platform) -> Result<(), String>;

    fn is_valid_name(&self, name: &str, platform: Platform) -> bool {
        self.check(name, platform).is_ok()
    }
}

/// Reserved device names on Windows, compared case-insensitively and
/// also reserved with any extension (`aux.txt`).
const WINDOWS_RESERVED: &[&str] = &[
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8",
    "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

const WINDOWS_INVALID_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*', '\\'];

/// Built-in validation table.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlatformNameRules;

impl NameValidator for PlatformNameRules {
    fn check(&self, name: &str, platform: Platform) -> Result<(), String> {
        if name.is_empty() {
            return Err("name is empty".into());
        }
        if name == "." || name == ".." {
            return Err(format!("{name:?} is reserved"));
        }
        if let Some(c) = name.chars().find(|c| *c == '/' || *c == '\0') {
            return Err(format!("{c:?} is an invalid character"));
        }

        match platform {
            Platform::Unix => Ok(()),
            Platform::Macos => match name.contains(':') {
                true => Err("':' is an invalid character".into()),
                false => Ok(()),
            },
            Platform::Windows => check_windows(name),
        }
    }
}

fn check_windows(name: &str) -> Result<(), String> {
    if let Some(c) = name
        .chars()
        .find(|c| WINDOWS_INVALID_CHARS.contains(c) || (*c as u32) < 32)
    {
        return Err(format!("{c:?} is an invalid character"));
    }
    if name.ends_with('.') || name.ends_with(' ') {
        return Err("names may not end with a dot or a space".into());
    }
    let stem = name.split('.').next().unwrap_or(name).to_ascii_lowercase();
    if WINDOWS_RESERVED.contains(&stem.as_str()) {
        return Err(format!("{name:?} is a reserved device name"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_names_only_on_windows() {
        let rules = PlatformNameRules;
        for name in ["aux", "CON", "lpt1", "nul.txt", "foo.", "foo ", "a:b", "a*b"] {
            assert!(!rules.is_valid_name(name, Platform::Windows), "{name}");
        }
        for name in ["aux", "CON", "lpt1", "nul.txt", "foo.", "foo ", "a*b"] {
            assert!(rules.is_valid_name(name, Platform::Unix), "{name}");
        }
    }

    #[test]
    fn test_universal_rules() {
        let rules = PlatformNameRules;
        for platform in [Platform::Windows, Platform::Unix, Platform::Macos] {
            assert!(!rules.is_valid_name("", platform));
            assert!(!rules.is_valid_name("..", platform));
            assert!(!rules.is_valid_name("a/b", platform));
            assert!(rules.is_valid_name("console", platform));
        }
        assert!(!rules.is_valid_name("a:b", Platform::Macos));
    }

    #[test]
    fn test_platform_strings() {
        assert_eq!(Platform::Macos.to_string(), "macos");
        assert_eq!("windows".parse::<Platform>().unwrap(), Platform::Windows);
    }
}
