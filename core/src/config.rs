/// How a divergent snapshot is reconciled when no structural diff is available: the upstream's
/// initial notification disagreeing with the reset already shown, or a container swapping sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplaceStrategy {
    /// Delete every old position, then insert every new position
    #[default]
    Full,
    /// Keep the longest common prefix, then the longest common suffix of what remains, and replace
    /// only the window between them. Moved elements are never detected.
    TrimCommonEnds,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileConfig {
    pub replace: ReplaceStrategy,
}

impl ReconcileConfig {
    pub fn new() -> Self { Self::default() }

    pub fn with_replace(mut self, replace: ReplaceStrategy) -> Self {
        self.replace = replace;
        self
    }
}
