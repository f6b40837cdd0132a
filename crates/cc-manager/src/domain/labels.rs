//! Node label keys and the pause/unpause encoding of component deploy labels.
//!
//! The GPU operator deploys each of its components according to a node
//! label such as `nvidia.com/gpu.deploy.vgpu-manager`. To take a component
//! off the node temporarily, its label value is rewritten so that it still
//! remembers the original value but no longer matches the operator's
//! selector. Unpausing restores the remembered value.

/// Desired CC mode requested by the cluster administrator.
pub const CC_MODE_LABEL: &str = "nvidia.com/cc.mode";

/// CC mode reported back after reconciliation.
pub const CC_MODE_STATE_LABEL: &str = "nvidia.com/cc.mode.state";

/// State value written when applying a mode failed.
pub const CC_MODE_FAILED: &str = "failed";

/// Marker added to a component label value while the component is paused.
pub const PAUSED_SENTINEL: &str = "paused-for-cc-mode-change";

/// What the operator is told to do with a component on this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deployment {
    /// No label; the operator default applies.
    Unset,
    /// Explicitly disabled with `false`.
    Disabled,
    /// Any other value, typically `true`.
    Enabled(String),
}

/// Decoded form of a component deploy label value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentLabel {
    deployment: Deployment,
    paused: bool,
}

impl ComponentLabel {
    pub fn new(deployment: Deployment) -> Self {
        Self {
            deployment,
            paused: false,
        }
    }

    pub fn decode(raw: &str) -> Self {
        match raw {
            "" => Self::new(Deployment::Unset),
            "false" => Self::new(Deployment::Disabled),
            PAUSED_SENTINEL => Self {
                deployment: Deployment::Enabled("true".to_string()),
                paused: true,
            },
            _ if raw.contains(PAUSED_SENTINEL) => Self {
                deployment: Deployment::Enabled(strip_sentinel(raw)),
                paused: true,
            },
            _ => Self::new(Deployment::Enabled(raw.to_string())),
        }
    }

    pub fn encode(&self) -> String {
        match (&self.deployment, self.paused) {
            (Deployment::Unset, _) => String::new(),
            (Deployment::Disabled, _) => "false".to_string(),
            (Deployment::Enabled(value), false) => value.clone(),
            (Deployment::Enabled(value), true) if value == "true" => PAUSED_SENTINEL.to_string(),
            (Deployment::Enabled(value), true) => format!("{value}_{PAUSED_SENTINEL}"),
        }
    }

    pub fn deployment(&self) -> &Deployment {
        &self.deployment
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Only enabled components can be paused.
    pub fn with_paused(self, paused: bool) -> Self {
        let paused = paused && matches!(self.deployment, Deployment::Enabled(_));
        Self { paused, ..self }
    }
}

fn strip_sentinel(raw: &str) -> String {
    raw.replace(&format!("_{PAUSED_SENTINEL}"), "")
        .replace(PAUSED_SENTINEL, "")
        .trim_matches('_')
        .to_string()
}

/// Label value that keeps the component off the node.
///
/// Unset and disabled labels are returned unchanged, as are values that are
/// already paused.
pub fn pause(raw: &str) -> String {
    let label = ComponentLabel::decode(raw);
    if label.is_paused() {
        return raw.to_string();
    }
    label.with_paused(true).encode()
}

/// Label value that lets the component be scheduled again.
pub fn unpause(raw: &str) -> String {
    ComponentLabel::decode(raw).with_paused(false).encode()
}
