/// Treatment of the diffuse part of the initial state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DiffuseHandling {
    /// Exact diffuse recursions (Durbin-Koopman).
    Exact,
    /// Large-variance approximation: kappa * B * B' is folded into Pf0.
    Approximate { kappa: f64 },
}

/// How the diffuse covariance Pi is carried until it vanishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffuseCollapse {
    /// Pi = B * B' kept as its factor; each informative step removes one column.
    Factor,
    /// Pi propagated as a full matrix, collapsed once it becomes negligible.
    Covariance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmoothingMode {
    /// Means only (no covariance propagation).
    Fast,
    /// Means and covariances.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Numerics {
    /// Square-root numerics when the system is flagged as delicate.
    Auto,
    Standard,
    SquareRoot,
}

/// Configuration of one filter + smoother pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SsfConfig {
    pub diffuse: DiffuseHandling,
    pub collapse: DiffuseCollapse,
    pub smoothing: SmoothingMode,
    pub numerics: Numerics,
    /// Variances at or below this value are treated as exactly zero.
    pub zero_tolerance: f64,
    /// Keep the predicted states a_{t|t-1}.
    pub store_states: bool,
    /// Keep the predicted covariances P_{t|t-1} (forced by full smoothing).
    pub store_covariances: bool,
    /// First time index written to the state/covariance stores.
    pub storage_start: usize,
}

impl Default for SsfConfig {
    fn default() -> Self {
        Self {
            diffuse: DiffuseHandling::Exact,
            collapse: DiffuseCollapse::Factor,
            smoothing: SmoothingMode::Fast,
            numerics: Numerics::Auto,
            zero_tolerance: 1e-9,
            store_states: true,
            store_covariances: false,
            storage_start: 0,
        }
    }
}

impl SsfConfig {
    pub fn full() -> Self {
        Self {
            smoothing: SmoothingMode::Full,
            ..Self::default()
        }
    }

    pub fn with_smoothing(mut self, smoothing: SmoothingMode) -> Self {
        self.smoothing = smoothing;
        self
    }

    pub fn with_numerics(mut self, numerics: Numerics) -> Self {
        self.numerics = numerics;
        self
    }

    pub fn with_collapse(mut self, collapse: DiffuseCollapse) -> Self {
        self.collapse = collapse;
        self
    }

    pub fn with_diffuse(mut self, diffuse: DiffuseHandling) -> Self {
        self.diffuse = diffuse;
        self
    }

    pub fn with_zero_tolerance(mut self, tol: f64) -> Self {
        self.zero_tolerance = tol;
        self
    }

    pub fn with_storage_start(mut self, start: usize) -> Self {
        self.storage_start = start;
        self
    }

    pub fn with_covariances(mut self, store: bool) -> Self {
        self.store_covariances = store;
        self
    }

    /// Keep nothing beyond the likelihood and the per-step scalars.
    pub fn without_storage(mut self) -> Self {
        self.store_states = false;
        self.store_covariances = false;
        self.smoothing = SmoothingMode::Fast;
        self
    }

    /// Resolve `Numerics::Auto` against the system's delicacy flag.
    pub fn square_root(&self, delicate: bool) -> bool {
        match self.numerics {
            Numerics::Auto => delicate,
            Numerics::Standard => false,
            Numerics::SquareRoot => true,
        }
    }

    /// Covariances must be kept when the full smoother will consume them.
    pub fn needs_covariances(&self) -> bool {
        self.store_covariances || self.smoothing == SmoothingMode::Full
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SsfConfig::default();
        assert_eq!(config.diffuse, DiffuseHandling::Exact);
        assert_eq!(config.collapse, DiffuseCollapse::Factor);
        assert_eq!(config.smoothing, SmoothingMode::Fast);
        assert!((config.zero_tolerance - 1e-9).abs() < 1e-20);
        assert!(config.store_states);
        assert!(!config.needs_covariances());
    }

    #[test]
    fn test_full_forces_covariances() {
        let config = SsfConfig::full();
        assert!(!config.store_covariances);
        assert!(config.needs_covariances());
    }

    #[test]
    fn test_square_root_resolution() {
        let config = SsfConfig::default();
        assert!(!config.square_root(false));
        assert!(config.square_root(true));

        let config = config.with_numerics(Numerics::Standard);
        assert!(!config.square_root(true));

        let config = config.with_numerics(Numerics::SquareRoot);
        assert!(config.square_root(false));
    }

    #[test]
    fn test_builder_chain() {
        let config = SsfConfig::default()
            .with_collapse(DiffuseCollapse::Covariance)
            .with_diffuse(DiffuseHandling::Approximate { kappa: 1e7 })
            .with_zero_tolerance(1e-12)
            .with_storage_start(5);
        assert_eq!(config.collapse, DiffuseCollapse::Covariance);
        assert_eq!(config.diffuse, DiffuseHandling::Approximate { kappa: 1e7 });
        assert_eq!(config.storage_start, 5);
    }
}
