extern crate proc_macro;

macro_rules! bail {
    ($item:expr, $fmt:literal $($tts:tt)*) => {
        return Err(Error::new_spanned(
            &$item,
            format!(concat!("transmemo: ", $fmt) $($tts)*)
        ))
    }
}

mod transform;

use proc_macro::TokenStream;
use quote::quote;
use syn::{Error, Result};

/// Turn a function into a static transformation engine.
///
/// The function takes the raw value and returns either a `String` or a
/// `Result<String, TransformError>`. After expansion, calling it returns a
/// `StaticEngine` that runs the original body. The engine is named after the
/// function unless a name is given.
///
/// ```ignore
/// use transmemo::{Engine, TransformError};
///
/// #[transmemo::transform]
/// fn shout(raw: &str) -> String {
///     raw.to_uppercase()
/// }
///
/// #[transmemo::transform(name = "celsius")]
/// fn to_celsius(raw: &str) -> Result<String, TransformError> {
///     let f: f64 = raw
///         .parse()
///         .map_err(|_| TransformError::fault("celsius", "not a number"))?;
///     Ok(format!("{:.1}", (f - 32.0) / 1.8))
/// }
///
/// assert_eq!(shout().invoke("hey").unwrap(), "HEY");
/// assert_eq!(to_celsius().name(), "celsius");
/// assert_eq!(to_celsius().invoke("212").unwrap(), "100.0");
/// ```
#[proc_macro_attribute]
pub fn transform(args: TokenStream, stream: TokenStream) -> TokenStream {
    let meta = syn::parse_macro_input!(args as transform::Meta);
    let func = syn::parse_macro_input!(stream as syn::ItemFn);
    transform::expand(meta, func)
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}
