//! Input filter for web-originated terminal bytes.
//!
//! Remote peers type into a shell running on the host's machine; certain
//! control bytes (Ctrl-C killing the child, Ctrl-D closing the shell) are
//! dropped before they reach the PTY. Dropped bytes are reported back to
//! the originating peer as a `BLOCKED_SIGNAL` diagnostic.

/// Which control bytes to drop from remote input.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Drop 0x03 (Ctrl-C, would raise SIGINT).
    pub block_ctrl_c: bool,
    /// Drop 0x04 (Ctrl-D, EOF to the shell).
    pub block_ctrl_d: bool,
    /// Drop 0x1A (Ctrl-Z, would raise SIGTSTP).
    pub block_ctrl_z: bool,
    /// Additional bytes to drop.
    pub extra_blocked: Vec<u8>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            block_ctrl_c: true,
            block_ctrl_d: true,
            block_ctrl_z: false,
            extra_blocked: Vec::new(),
        }
    }
}

/// Result of filtering one input chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterOutcome {
    /// Input with every configured control byte removed.
    pub data: Vec<u8>,
    /// True when at least one byte was dropped.
    pub blocked: bool,
    /// Names of the signals/bytes actually dropped, in first-seen order.
    pub blocked_signals: Vec<String>,
}

/// Filters remote input before it reaches the PTY.
#[derive(Debug, Clone, Default)]
pub struct InputFilter {
    config: FilterConfig,
}

impl InputFilter {
    /// Create a filter with the given configuration.
    #[must_use]
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }

    /// Drop configured control bytes from `input`.
    ///
    /// When nothing is blocked, `data` is byte-identical to the input.
    #[must_use]
    pub fn filter(&self, input: &[u8]) -> FilterOutcome {
        let mut data = Vec::with_capacity(input.len());
        let mut blocked_signals: Vec<String> = Vec::new();

        for &byte in input {
            match self.signal_name(byte) {
                Some(name) => {
                    if !blocked_signals.iter().any(|s| s == &name) {
                        blocked_signals.push(name);
                    }
                }
                None => data.push(byte),
            }
        }

        FilterOutcome {
            data,
            blocked: !blocked_signals.is_empty(),
            blocked_signals,
        }
    }

    /// Name for a blocked byte, or `None` when the byte passes through.
    ///
    /// The named bytes are the ones the line discipline turns into
    /// something host-hostile; everything else configured gets a hex name.
    fn signal_name(&self, byte: u8) -> Option<String> {
        match byte {
            0x03 if self.config.block_ctrl_c => Some("SIGINT".to_string()), // Ctrl+C (ETX)
            0x04 if self.config.block_ctrl_d => Some("EOF".to_string()),    // Ctrl+D (EOT)
            0x1A if self.config.block_ctrl_z => Some("SIGTSTP".to_string()), // Ctrl+Z (SUB)
            b if self.config.extra_blocked.contains(&b) => Some(format!("0x{b:02X}")),
            _ => None,
        }
    }
}
