//! Datatype and operator tables
//!
//! Most element kinds map onto a datatype the backend already knows. Half
//! precision and bfloat16 do not, so they are built as two-byte contiguous
//! types, and their reductions are registered as user operators backed by
//! [`reduce::accumulate`]. So are max/min over complex values, which the
//! backend does not order, and every boolean reduction: the backend only
//! accepts its logical operators on booleans, so sum and max become logical
//! or and min becomes logical and.

use crate::backend::{BuiltinDatatype, CommBackend, DatatypeHandle, OpHandle, UserFunction};
use crate::error::{Error, Result};
use crate::kind::{ElementKind, ReductionKind};
use crate::reduce::{self, LogicalAnd, LogicalOr, Max, Min, Sum};
use half::{bf16, f16};
use num_complex::Complex32;
use std::collections::HashMap;
use tracing::debug;

const SYNTHESIZED_OPS: [(ElementKind, ReductionKind, UserFunction); 11] = [
    (ElementKind::Bool, ReductionKind::Sum, reduce::accumulate::<u8, LogicalOr>),
    (ElementKind::Bool, ReductionKind::Max, reduce::accumulate::<u8, LogicalOr>),
    (ElementKind::Bool, ReductionKind::Min, reduce::accumulate::<u8, LogicalAnd>),
    (ElementKind::Float16, ReductionKind::Sum, reduce::accumulate::<f16, Sum>),
    (ElementKind::Float16, ReductionKind::Max, reduce::accumulate::<f16, Max>),
    (ElementKind::Float16, ReductionKind::Min, reduce::accumulate::<f16, Min>),
    (ElementKind::BFloat16, ReductionKind::Sum, reduce::accumulate::<bf16, Sum>),
    (ElementKind::BFloat16, ReductionKind::Max, reduce::accumulate::<bf16, Max>),
    (ElementKind::BFloat16, ReductionKind::Min, reduce::accumulate::<bf16, Min>),
    (ElementKind::Complex64, ReductionKind::Max, reduce::accumulate::<Complex32, Max>),
    (ElementKind::Complex64, ReductionKind::Min, reduce::accumulate::<Complex32, Min>),
];

/// Backend datatype for a kind, when it has one natively
pub fn builtin_for(kind: ElementKind) -> Option<BuiltinDatatype> {
    match kind {
        ElementKind::Bool => Some(BuiltinDatatype::Bool),
        ElementKind::Int8 => Some(BuiltinDatatype::Int8),
        ElementKind::UInt8 => Some(BuiltinDatatype::UInt8),
        ElementKind::Int16 => Some(BuiltinDatatype::Int16),
        ElementKind::UInt16 => Some(BuiltinDatatype::UInt16),
        ElementKind::Int32 => Some(BuiltinDatatype::Int32),
        ElementKind::UInt32 => Some(BuiltinDatatype::UInt32),
        ElementKind::Int64 => Some(BuiltinDatatype::Int64),
        ElementKind::UInt64 => Some(BuiltinDatatype::UInt64),
        ElementKind::Float32 => Some(BuiltinDatatype::Float32),
        ElementKind::Float64 => Some(BuiltinDatatype::Float64),
        ElementKind::Complex64 => Some(BuiltinDatatype::Complex64),
        ElementKind::Float16 | ElementKind::BFloat16 | ElementKind::Complex128 => None,
    }
}

/// Resolved datatypes and operators of one backend
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    datatypes: HashMap<ElementKind, DatatypeHandle>,
    builtin_ops: HashMap<ReductionKind, OpHandle>,
    synthesized_ops: HashMap<(ElementKind, ReductionKind), OpHandle>,
}

impl TypeRegistry {
    /// Build the tables, creating the synthesized types and operators on `backend`
    ///
    /// Must run after the backend is initialized, once per backend.
    pub fn synthesize(backend: &dyn CommBackend) -> Result<Self> {
        let mut datatypes = HashMap::new();
        for kind in ElementKind::ALL {
            if let Some(builtin) = builtin_for(kind) {
                datatypes.insert(kind, backend.builtin_datatype(builtin));
            }
        }

        let byte = backend.builtin_datatype(BuiltinDatatype::UInt8);
        for kind in [ElementKind::Float16, ElementKind::BFloat16] {
            let pair = backend.type_contiguous(2, byte)?;
            datatypes.insert(kind, backend.type_commit(pair)?);
        }

        let builtin_ops = ReductionKind::ALL
            .iter()
            .map(|&reduction| (reduction, backend.builtin_op(reduction)))
            .collect();

        let mut synthesized_ops = HashMap::new();
        for (kind, reduction, function) in SYNTHESIZED_OPS {
            synthesized_ops.insert((kind, reduction), backend.op_create(function, true)?);
        }

        debug!(
            backend = backend.name(),
            datatypes = datatypes.len(),
            operators = synthesized_ops.len(),
            "type registry synthesized"
        );
        Ok(Self {
            datatypes,
            builtin_ops,
            synthesized_ops,
        })
    }

    pub fn datatype_for(&self, kind: ElementKind) -> Result<DatatypeHandle> {
        self.datatypes.get(&kind).copied().ok_or(Error::UnsupportedType(kind))
    }

    /// Synthesized operator when one exists, the backend's own otherwise
    pub fn operator_for(&self, kind: ElementKind, reduction: ReductionKind) -> Result<OpHandle> {
        self.datatype_for(kind)?;
        if let Some(&op) = self.synthesized_ops.get(&(kind, reduction)) {
            return Ok(op);
        }
        self.builtin_ops.get(&reduction).copied().ok_or(Error::UnsupportedType(kind))
    }

    pub fn supports(&self, kind: ElementKind) -> bool {
        self.datatypes.contains_key(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;

    fn registry() -> (LocalBackend, TypeRegistry) {
        let backend = LocalBackend::world(1).remove(0);
        backend.init().unwrap();
        let registry = TypeRegistry::synthesize(&backend).unwrap();
        (backend, registry)
    }

    #[test]
    fn synthesis_creates_two_types_and_eleven_ops() {
        let (backend, registry) = registry();
        let stats = backend.stats();
        assert_eq!(stats.types_created, 2);
        assert_eq!(stats.ops_created, 11);
        assert_ne!(
            registry.datatype_for(ElementKind::Float16).unwrap(),
            registry.datatype_for(ElementKind::BFloat16).unwrap()
        );
    }

    #[test]
    fn complex128_is_unsupported() {
        let (_backend, registry) = registry();
        assert!(!registry.supports(ElementKind::Complex128));
        assert_eq!(
            registry.datatype_for(ElementKind::Complex128),
            Err(Error::UnsupportedType(ElementKind::Complex128))
        );
        assert_eq!(
            registry.operator_for(ElementKind::Complex128, ReductionKind::Sum),
            Err(Error::UnsupportedType(ElementKind::Complex128))
        );
    }

    #[test]
    fn operators_prefer_synthesized_entries() {
        let (backend, registry) = registry();
        let native_max = backend.builtin_op(ReductionKind::Max);
        let native_sum = backend.builtin_op(ReductionKind::Sum);

        assert_eq!(registry.operator_for(ElementKind::Float32, ReductionKind::Max).unwrap(), native_max);
        assert_eq!(registry.operator_for(ElementKind::Complex64, ReductionKind::Sum).unwrap(), native_sum);
        assert_ne!(registry.operator_for(ElementKind::Complex64, ReductionKind::Max).unwrap(), native_max);
        assert_ne!(registry.operator_for(ElementKind::Float16, ReductionKind::Sum).unwrap(), native_sum);
    }

    #[test]
    fn bool_reductions_never_use_native_operators() {
        let (backend, registry) = registry();
        for reduction in ReductionKind::ALL {
            let op = registry.operator_for(ElementKind::Bool, reduction).unwrap();
            assert_ne!(op, backend.builtin_op(reduction), "{reduction}");
        }
        assert_ne!(
            registry.operator_for(ElementKind::Bool, ReductionKind::Sum).unwrap(),
            registry.operator_for(ElementKind::Bool, ReductionKind::Min).unwrap()
        );
    }

    #[test]
    fn synthesis_fails_on_uninitialized_backend() {
        let backend = LocalBackend::world(1).remove(0);
        assert!(matches!(TypeRegistry::synthesize(&backend), Err(Error::Comm { .. })));
    }
}
