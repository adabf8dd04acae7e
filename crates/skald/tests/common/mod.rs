//! Shared fixtures for the context tests.
#![allow(dead_code)]

use std::rc::Rc;

use skald::types::DataType;
use skald::{Engine, EngineConfig, FunctionBuilder, FunctionDef, FunctionId, TypeId};

pub fn engine() -> Rc<Engine> {
    Engine::new(EngineConfig::default())
}

pub fn int32() -> DataType {
    DataType::value(TypeId::INT32)
}

pub fn void() -> DataType {
    DataType::value(TypeId::VOID)
}

/// Registers a free script function returning `int`.
pub fn int_fn(
    engine: &Rc<Engine>,
    name: &str,
    params: Vec<DataType>,
    build: impl FnOnce(&mut FunctionBuilder),
) -> FunctionId {
    let mut b = FunctionBuilder::new();
    build(&mut b);
    engine.register_function(FunctionDef::script(name, int32(), params, b.build()))
}
