//! Conversion between host values and interpreter values.
//!
//! The interpreter works on [`serde_json::Value`]. Arguments go in through
//! [`IntoArgs`], results come back out as any `DeserializeOwned` type.

use serde::Serialize;
use serde::de::DeserializeOwned;

pub use serde_json::Value;

use crate::error::{ScriptError, ScriptResult};

/// A positional argument list that can be handed to a script callable.
///
/// Implemented for `()`, tuples of up to eight `Serialize` values and
/// `Vec<Value>`.
pub trait IntoArgs {
    fn into_args(self) -> Result<Vec<Value>, serde_json::Error>;
}

impl IntoArgs for () {
    fn into_args(self) -> Result<Vec<Value>, serde_json::Error> {
        Ok(Vec::new())
    }
}

impl IntoArgs for Vec<Value> {
    fn into_args(self) -> Result<Vec<Value>, serde_json::Error> {
        Ok(self)
    }
}

macro_rules! impl_into_args {
    ($($name:ident),+) => {
        impl<$($name: Serialize),+> IntoArgs for ($($name,)+) {
            #[allow(non_snake_case)]
            fn into_args(self) -> Result<Vec<Value>, serde_json::Error> {
                let ($($name,)+) = self;
                Ok(vec![$(serde_json::to_value($name)?),+])
            }
        }
    };
}

impl_into_args!(A);
impl_into_args!(A, B);
impl_into_args!(A, B, C);
impl_into_args!(A, B, C, D);
impl_into_args!(A, B, C, D, E);
impl_into_args!(A, B, C, D, E, F);
impl_into_args!(A, B, C, D, E, F, G);
impl_into_args!(A, B, C, D, E, F, G, H);

pub(crate) fn to_args(method: &str, args: impl IntoArgs) -> ScriptResult<Vec<Value>> {
    args.into_args().map_err(|e| ScriptError::conversion(method, e))
}

pub(crate) fn from_value<R: DeserializeOwned>(method: &str, value: Value) -> ScriptResult<R> {
    serde_json::from_value(value).map_err(|e| ScriptError::conversion(method, e))
}
