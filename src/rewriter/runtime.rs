//! References to the runtime filter support type.
//!
//! The rewritten code relies on a small runtime library that keeps a stack of active filter
//! objects. The rewriter never implements it; it only emits calls against this contract:
//!
//! ```text
//! abstract class ExceptionFilter {
//!     protected ExceptionFilter();
//!     static void Push(ExceptionFilter filter);
//!     static void Pop(ExceptionFilter filter);
//!     static void PerformEvaluate(object exception);
//!     bool ShouldRunHandler(object exception);
//!     abstract int Evaluate(object exception);
//! }
//! ```
//!
//! `PerformEvaluate` asks every active filter, innermost first, to evaluate the exception and
//! remembers which one claimed it. `ShouldRunHandler` then answers for a single filter object.

use crate::{
    metadata::{
        module::{MemberSig, Module},
        signatures::TypeSig,
        token::Token,
    },
    rewriter::RewriteConfig,
};

/// Imported members of the runtime filter support type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterRuntime {
    /// `System.Object`
    pub object: Token,
    /// `System.Object::.ctor()`
    pub object_ctor: Token,
    /// The filter base type
    pub filter_type: Token,
    /// `ExceptionFilter::.ctor()`
    pub filter_ctor: Token,
    /// `static void Push(ExceptionFilter)`
    pub push: Token,
    /// `static void Pop(ExceptionFilter)`
    pub pop: Token,
    /// `static void PerformEvaluate(object)`
    pub perform_evaluate: Token,
    /// `bool ShouldRunHandler(object)`
    pub should_run_handler: Token,
    /// `abstract int Evaluate(object)`
    pub evaluate: Token,
}

impl FilterRuntime {
    /// Name of the overridable predicate method on the filter base type.
    pub const EVALUATE: &'static str = "Evaluate";

    /// Imports (or finds the already interned) references into `module`.
    pub fn import(module: &mut Module, config: &RewriteConfig) -> Self {
        let object = module.import_type("System.Runtime", "System", "Object");
        let object_ctor = module.member_ref(
            object,
            ".ctor",
            MemberSig::instance(Vec::new(), TypeSig::Void),
        );

        let filter_type = module.import_type(
            &config.runtime_scope,
            &config.runtime_namespace,
            &config.runtime_type,
        );
        let filter_sig = TypeSig::Class(filter_type);
        let filter_ctor = module.member_ref(
            filter_type,
            ".ctor",
            MemberSig::instance(Vec::new(), TypeSig::Void),
        );
        let push = module.member_ref(
            filter_type,
            "Push",
            MemberSig::static_method(vec![filter_sig.clone()], TypeSig::Void),
        );
        let pop = module.member_ref(
            filter_type,
            "Pop",
            MemberSig::static_method(vec![filter_sig], TypeSig::Void),
        );
        let perform_evaluate = module.member_ref(
            filter_type,
            "PerformEvaluate",
            MemberSig::static_method(vec![TypeSig::Object], TypeSig::Void),
        );
        let should_run_handler = module.member_ref(
            filter_type,
            "ShouldRunHandler",
            MemberSig::instance(vec![TypeSig::Object], TypeSig::Boolean),
        );
        let evaluate = module.member_ref(
            filter_type,
            Self::EVALUATE,
            MemberSig::instance(vec![TypeSig::Object], TypeSig::I4),
        );

        FilterRuntime {
            object,
            object_ctor,
            filter_type,
            filter_ctor,
            push,
            pop,
            perform_evaluate,
            should_run_handler,
            evaluate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::token::TableId;

    #[test]
    fn test_import_is_interned() {
        let mut module = Module::new("Demo.dll");
        let config = RewriteConfig::default();
        let first = FilterRuntime::import(&mut module, &config);
        let second = FilterRuntime::import(&mut module, &config);
        assert_eq!(first, second);

        assert!(first.filter_type.is(TableId::TypeRef));
        assert!(first.push.is(TableId::MemberRef));
        assert_eq!(
            module.type_name(first.filter_type).unwrap(),
            "ExceptionFilterSupport.ExceptionFilter"
        );
        assert!(module.is_system_object(first.object));

        let should_run = module.member_ref_def(first.should_run_handler).unwrap();
        assert_eq!(should_run.name, "ShouldRunHandler");
        assert_eq!(
            should_run.signature,
            MemberSig::instance(vec![TypeSig::Object], TypeSig::Boolean)
        );
    }

    #[test]
    fn test_configured_names() {
        let mut module = Module::new("Demo.dll");
        let config = RewriteConfig::default().with_runtime("Rt", "Rt.Filters", "Filter");
        let runtime = FilterRuntime::import(&mut module, &config);
        assert_eq!(module.type_name(runtime.filter_type).unwrap(), "Rt.Filters.Filter");
        assert_eq!(module.type_ref(runtime.filter_type).unwrap().scope, "Rt");
    }
}
