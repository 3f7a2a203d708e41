use serde::{Deserialize, Serialize};

use crate::model::Visibility;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Linked conversations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Defaults for child conversations spawned from a parent turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkingConfig {
    #[serde(default)]
    pub default_visibility: Visibility,
    /// `created_by` on link messages when the caller gives none.
    #[serde(default = "d_link")]
    pub link_actor: String,
    /// `mode` on link messages when the caller gives none.
    #[serde(default = "d_link")]
    pub link_mode: String,
}

impl Default for LinkingConfig {
    fn default() -> Self {
        Self {
            default_visibility: Visibility::Private,
            link_actor: d_link(),
            link_mode: d_link(),
        }
    }
}

fn d_link() -> String {
    "link".into()
}
