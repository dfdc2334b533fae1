use std::collections::HashMap;

use kestrel_accelerate_api::{DispatchError, Result};

use super::{
    BatchNormBuilder, Conv2dBuilder, LrnBuilder, OpBuilder, OpDef, Operation, ShapeLookup,
    SliceBuilder, StackBuilder,
};

pub type BuilderFactory = fn() -> Box<dyn OpBuilder>;

fn factory<B: OpBuilder + Default + 'static>() -> Box<dyn OpBuilder> {
    Box::new(B::default())
}

/// Operator type tag -> builder constructor.
#[derive(Default)]
pub struct OpRegistry {
    builders: HashMap<String, BuilderFactory>,
}

impl OpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every operator shipped in this crate.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("Conv2D", factory::<Conv2dBuilder>);
        registry.register("Slice", factory::<SliceBuilder>);
        registry.register("Stack", factory::<StackBuilder>);
        registry.register("Pack", factory::<StackBuilder>);
        registry.register("BatchNorm", factory::<BatchNormBuilder>);
        registry.register("LocalResponseNorm", factory::<LrnBuilder>);
        registry
    }

    /// Register (or replace) the builder for `op_type`.
    pub fn register(&mut self, op_type: &str, factory: BuilderFactory) {
        if self.builders.insert(op_type.to_string(), factory).is_some() {
            log::debug!("op_registry: replaced builder for {op_type}");
        }
    }

    pub fn contains(&self, op_type: &str) -> bool {
        self.builders.contains_key(op_type)
    }

    pub fn op_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.builders.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn build(&self, def: &OpDef, shapes: &dyn ShapeLookup) -> Result<Box<dyn Operation>> {
        let factory = self.builders.get(&def.op_type).ok_or_else(|| {
            DispatchError::config(def.context(), format!("unknown operator type '{}'", def.op_type))
        })?;
        let op = factory().build_op(def, shapes)?;
        log::trace!("op_registry: built {}", def.context());
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{NoShapes, OpDefBuilder};

    #[test]
    fn pack_and_stack_share_a_builder() {
        let registry = OpRegistry::with_defaults();
        for op_type in ["Pack", "Stack"] {
            let def = OpDefBuilder::new(op_type, "s").input("a").output("y").build();
            let op = registry.build(&def, &NoShapes).unwrap();
            assert_eq!(op.op_type(), "Stack");
        }
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let registry = OpRegistry::with_defaults();
        let def = OpDefBuilder::new("Softmax", "sm").build();
        let err = registry.build(&def, &NoShapes).err().unwrap();
        assert!(err.is_config());
        assert!(err.to_string().contains("Softmax"));
    }

    #[test]
    fn op_types_are_sorted() {
        let registry = OpRegistry::with_defaults();
        let types = registry.op_types();
        let mut sorted = types.clone();
        sorted.sort_unstable();
        assert_eq!(types, sorted);
        assert!(registry.contains("Conv2D"));
    }
}
