use std::collections::HashMap;

/// Immutable action-name lookup, built once at startup and handed to the
/// conductor by reference. Maps a platform-agnostic action name to the
/// EV3 daemon line command or the Spike executor action name.
#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    ev3: HashMap<String, String>,
    spike: HashMap<String, String>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ev3(mut self, action: impl Into<String>, command: impl Into<String>) -> Self {
        self.ev3.insert(action.into(), command.into());
        self
    }

    pub fn with_spike(mut self, action: impl Into<String>, name: impl Into<String>) -> Self {
        self.spike.insert(action.into(), name.into());
        self
    }

    /// EV3 line command for an action, or the action itself if unmapped
    /// (the daemon understands raw commands like `beep 880 200`).
    pub fn resolve_ev3<'a>(&'a self, action: &'a str) -> &'a str {
        self.ev3.get(action).map(String::as_str).unwrap_or(action)
    }

    pub fn resolve_spike<'a>(&'a self, action: &'a str) -> &'a str {
        self.spike.get(action).map(String::as_str).unwrap_or(action)
    }
}
