use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

/// Email provider whose attachment limit sets the output budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gmail,
    Outlook,
    Other,
}

impl Provider {
    /// Attachment cap in (decimal) megabytes
    pub fn attachment_limit_mb(&self) -> u64 {
        match self {
            Provider::Gmail => 25,
            Provider::Outlook => 20,
            Provider::Other => 15,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Gmail => "gmail",
            Provider::Outlook => "outlook",
            Provider::Other => "other",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "gmail" => Ok(Provider::Gmail),
            "outlook" => Ok(Provider::Outlook),
            "other" => Ok(Provider::Other),
            _ => Err(format!("Unknown email provider: {}", s)),
        }
    }
}

/// Maximum acceptable output size for one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetBudget {
    pub cap_bytes: u64,
    pub provider: Provider,
}

impl TargetBudget {
    pub fn for_provider(provider: Provider) -> Self {
        Self {
            cap_bytes: provider.attachment_limit_mb() * 1_000_000,
            provider,
        }
    }

    /// Largest size the enforcement loop accepts
    pub fn accepted_bytes(&self, tolerance: f64) -> u64 {
        (self.cap_bytes as f64 * (1.0 + tolerance)).floor() as u64
    }
}
