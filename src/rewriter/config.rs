//! Rewrite configuration
//!
//! These are the options a front end exposes as command line flags. The core only reads them.

/// Configuration for a [`crate::rewriter::FilterRewriter`] run
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct RewriteConfig {
    /// Stop at the first method that fails instead of tallying the failure and continuing
    pub abort_on_error: bool,

    /// Log every rewritten method at `info` level instead of `debug`
    pub verbose: bool,

    /// Rewrite methods that are generic or live on a generic type
    /// Synthesized types then declare the owner's generic parameters
    pub allow_generics: bool,

    /// Shrink long branches back into short forms after rewriting
    pub shrink_branches: bool,

    /// Resolution scope (assembly name) of the runtime filter support type
    pub runtime_scope: String,

    /// Namespace of the runtime filter support type
    pub runtime_namespace: String,

    /// Name of the runtime filter support type
    pub runtime_type: String,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            abort_on_error: false,
            verbose: false,
            allow_generics: false,
            shrink_branches: true,
            runtime_scope: "ExceptionFilterSupport".to_string(),
            runtime_namespace: "ExceptionFilterSupport".to_string(),
            runtime_type: "ExceptionFilter".to_string(),
        }
    }
}

impl RewriteConfig {
    /// Sets whether the first failing method aborts the run.
    #[must_use]
    pub fn with_abort_on_error(mut self, abort: bool) -> Self {
        self.abort_on_error = abort;
        self
    }

    /// Sets verbose per-method logging.
    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Sets whether generic methods and methods of generic types are eligible.
    #[must_use]
    pub fn with_generics(mut self, allow: bool) -> Self {
        self.allow_generics = allow;
        self
    }

    /// Sets whether branches are shrunk after rewriting.
    #[must_use]
    pub fn with_shrink_branches(mut self, shrink: bool) -> Self {
        self.shrink_branches = shrink;
        self
    }

    /// Names the runtime filter support type.
    #[must_use]
    pub fn with_runtime(
        mut self,
        scope: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        self.runtime_scope = scope.into();
        self.runtime_namespace = namespace.into();
        self.runtime_type = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RewriteConfig::default();
        assert!(!config.abort_on_error);
        assert!(!config.allow_generics);
        assert!(config.shrink_branches);
        assert_eq!(config.runtime_type, "ExceptionFilter");
    }

    #[test]
    fn test_builders() {
        let config = RewriteConfig::default()
            .with_abort_on_error(true)
            .with_generics(true)
            .with_runtime("Support", "Support.Runtime", "Filter");
        assert!(config.abort_on_error);
        assert!(config.allow_generics);
        assert_eq!(config.runtime_scope, "Support");
        assert_eq!(config.runtime_namespace, "Support.Runtime");
        assert_eq!(config.runtime_type, "Filter");
    }
}
