use serde::{Deserialize, Serialize};

/// The persona whose knowledge base and voice are modeled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub era: String,
}

impl KernelProfile {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            bio: String::new(),
            era: String::new(),
        }
    }

    /// "Name (era)", or just the name.
    pub fn display_name(&self) -> String {
        if self.era.trim().is_empty() {
            self.name.clone()
        } else {
            format!("{} ({})", self.name, self.era.trim())
        }
    }
}
