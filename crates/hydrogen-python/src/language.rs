//! Kernel language tags - only Python sessions get the middleware.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelLanguage {
    Python,
    #[serde(untagged)]
    Other(String),
}

impl KernelLanguage {
    pub fn is_python(&self) -> bool {
        matches!(self, KernelLanguage::Python)
    }
}

impl std::fmt::Display for KernelLanguage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelLanguage::Python => write!(f, "python"),
            KernelLanguage::Other(name) => write!(f, "{}", name),
        }
    }
}

impl std::str::FromStr for KernelLanguage {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python" | "python3" | "python2" | "py" => Ok(KernelLanguage::Python),
            other => Ok(KernelLanguage::Other(other.to_string())),
        }
    }
}

impl From<&str> for KernelLanguage {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(language) => language,
            Err(never) => match never {},
        }
    }
}
