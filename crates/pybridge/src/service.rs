//! Typed service binding: host objects exposed to the guest as commands.
//!
//! There is no runtime reflection here; a service is a set of typed
//! closures registered through the builder. Wire values convert to declared
//! parameter types through `FromWire` (integral widening and
//! numeric-to-numeric conversion allowed), and conversion failures surface
//! to the guest as handler errors, never as a crash.

use std::sync::Arc;

use rmpv::Value;

use crate::error::{BridgeError, Result};
use crate::queue::CommandHandler;

/// Conversion from a decoded wire value to a declared parameter type.
pub trait FromWire: Sized {
    fn from_wire(value: &Value) -> std::result::Result<Self, String>;
}

/// Conversion from a handler's return value back to a wire value.
pub trait IntoWire {
    fn into_wire(self) -> Value;
}

macro_rules! impl_from_wire_int {
    ($($ty:ty),*) => {$(
        impl FromWire for $ty {
            fn from_wire(value: &Value) -> std::result::Result<Self, String> {
                if let Some(n) = value.as_i64() {
                    return <$ty>::try_from(n)
                        .map_err(|_| format!("{n} does not fit in {}", stringify!($ty)));
                }
                if let Some(n) = value.as_u64() {
                    return <$ty>::try_from(n)
                        .map_err(|_| format!("{n} does not fit in {}", stringify!($ty)));
                }
                // Numeric conversion: a float with an integral value is
                // accepted for an integer parameter.
                if let Some(f) = value.as_f64() {
                    if f.fract() == 0.0 {
                        return Ok(f as $ty);
                    }
                    return Err(format!("{f} is not an integral value"));
                }
                Err(format!("cannot convert {value} to {}", stringify!($ty)))
            }
        }
    )*};
}

impl_from_wire_int!(i8, i16, i32, i64, u8, u16, u32, u64);

macro_rules! impl_from_wire_float {
    ($($ty:ty),*) => {$(
        impl FromWire for $ty {
            fn from_wire(value: &Value) -> std::result::Result<Self, String> {
                if let Some(f) = value.as_f64() {
                    return Ok(f as $ty);
                }
                if let Some(n) = value.as_i64() {
                    return Ok(n as $ty);
                }
                if let Some(n) = value.as_u64() {
                    return Ok(n as $ty);
                }
                Err(format!("cannot convert {value} to {}", stringify!($ty)))
            }
        }
    )*};
}

impl_from_wire_float!(f32, f64);

impl FromWire for bool {
    fn from_wire(value: &Value) -> std::result::Result<Self, String> {
        value
            .as_bool()
            .ok_or_else(|| format!("cannot convert {value} to bool"))
    }
}

impl FromWire for String {
    fn from_wire(value: &Value) -> std::result::Result<Self, String> {
        match value {
            Value::String(s) => s
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| "string is not valid UTF-8".to_string()),
            Value::Binary(bytes) => String::from_utf8(bytes.clone())
                .map_err(|_| "binary is not valid UTF-8".to_string()),
            other => Err(format!("cannot convert {other} to string")),
        }
    }
}

impl FromWire for Value {
    fn from_wire(value: &Value) -> std::result::Result<Self, String> {
        Ok(value.clone())
    }
}

impl FromWire for Vec<Value> {
    fn from_wire(value: &Value) -> std::result::Result<Self, String> {
        match value {
            Value::Array(items) => Ok(items.clone()),
            other => Err(format!("cannot convert {other} to array")),
        }
    }
}

impl IntoWire for () {
    fn into_wire(self) -> Value {
        Value::Nil
    }
}

impl IntoWire for Value {
    fn into_wire(self) -> Value {
        self
    }
}

macro_rules! impl_into_wire {
    ($($ty:ty),*) => {$(
        impl IntoWire for $ty {
            fn into_wire(self) -> Value {
                Value::from(self)
            }
        }
    )*};
}

impl_into_wire!(bool, i8, i16, i32, i64, u8, u16, u32, u64, f32, f64, String, &'static str);

impl<T: IntoWire> IntoWire for Option<T> {
    fn into_wire(self) -> Value {
        match self {
            Some(value) => value.into_wire(),
            None => Value::Nil,
        }
    }
}

impl<T: IntoWire> IntoWire for Vec<T> {
    fn into_wire(self) -> Value {
        Value::Array(self.into_iter().map(IntoWire::into_wire).collect())
    }
}

/// A typed method invocable from the wire. Implemented for closures of up
/// to five `FromWire` parameters returning `Result<impl IntoWire>`.
pub trait WireMethod<Args, Ret>: Send + Sync + 'static {
    fn arity(&self) -> usize;
    fn invoke(&self, args: Option<&[Value]>) -> Result<Value>;
}

macro_rules! count_args {
    () => { 0 };
    ($head:ident $($tail:ident)*) => { 1 + count_args!($($tail)*) };
}

macro_rules! impl_wire_method {
    ($($arg:ident),*) => {
        impl<Func, Ret, $($arg),*> WireMethod<($($arg,)*), Ret> for Func
        where
            Func: Fn($($arg),*) -> Result<Ret> + Send + Sync + 'static,
            Ret: IntoWire,
            $($arg: FromWire,)*
        {
            fn arity(&self) -> usize {
                count_args!($($arg)*)
            }

            #[allow(non_snake_case, unused_variables, unused_mut)]
            fn invoke(&self, args: Option<&[Value]>) -> Result<Value> {
                let arity = self.arity();
                let args = match args {
                    None if arity == 0 => &[][..],
                    None => {
                        return Err(BridgeError::Handler(format!(
                            "expected {arity} arguments, got none"
                        )))
                    }
                    Some(args) if args.len() != arity => {
                        return Err(BridgeError::Handler(format!(
                            "incorrect number of arguments: expected {arity}, got {}",
                            args.len()
                        )))
                    }
                    Some(args) => args,
                };
                let mut index = 0usize;
                $(
                    let $arg = <$arg as FromWire>::from_wire(&args[index])
                        .map_err(|err| BridgeError::Handler(format!("argument {index}: {err}")))?;
                    index += 1;
                )*
                (self)($($arg),*).map(IntoWire::into_wire)
            }
        }
    };
}

impl_wire_method!();
impl_wire_method!(A0);
impl_wire_method!(A0, A1);
impl_wire_method!(A0, A1, A2);
impl_wire_method!(A0, A1, A2, A3);
impl_wire_method!(A0, A1, A2, A3, A4);

/// Builder collecting a service's methods for registration with a queue
/// channel. The registered name is the name the guest invokes.
#[derive(Default)]
pub struct ServiceBinder {
    handlers: Vec<(String, CommandHandler)>,
}

impl ServiceBinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<Args, Ret>(
        mut self,
        name: &str,
        method: impl WireMethod<Args, Ret>,
    ) -> Self {
        let command = name.to_string();
        let handler: CommandHandler = Arc::new(move |data: Value, _request_id: &str| {
            let args = match &data {
                Value::Nil => None,
                Value::Array(items) => Some(items.as_slice()),
                other => {
                    return Err(BridgeError::Handler(format!(
                        "arguments must be an array, got {other}"
                    )))
                }
            };
            method.invoke(args)
        });
        self.handlers.push((command, handler));
        self
    }

    pub(crate) fn into_handlers(self) -> Vec<(String, CommandHandler)> {
        self.handlers
    }
}
