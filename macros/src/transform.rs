use syn::parse::{Parse, ParseStream};

use super::*;

mod kw {
    syn::custom_keyword!(name);
}

/// The attribute's arguments.
pub struct Meta {
    name: Option<syn::LitStr>,
}

impl Parse for Meta {
    fn parse(input: ParseStream) -> Result<Self> {
        let mut name = None;
        if input.peek(kw::name) {
            let _: kw::name = input.parse()?;
            let _: syn::Token![=] = input.parse()?;
            name = Some(input.parse()?);
            let _: Option<syn::Token![,]> = input.parse()?;
        }
        if !input.is_empty() {
            return Err(input.error("transmemo: expected `name = \"...\"`"));
        }
        Ok(Self { name })
    }
}

/// What the annotated function returns.
enum Output {
    Plain,
    Fallible,
}

/// Wrap a function into a static engine constructor.
pub fn expand(meta: Meta, func: syn::ItemFn) -> Result<proc_macro2::TokenStream> {
    let sig = &func.sig;
    if let Some(asyncness) = &sig.asyncness {
        bail!(asyncness, "async functions are not supported");
    }
    if !sig.generics.params.is_empty() {
        bail!(sig.generics, "generic functions are not supported");
    }

    let mut inputs = sig.inputs.iter();
    let (Some(input), None) = (inputs.next(), inputs.next()) else {
        bail!(sig, "expected exactly one parameter holding the raw value");
    };
    let typed = match input {
        syn::FnArg::Typed(typed) => typed,
        syn::FnArg::Receiver(_) => bail!(input, "methods are not supported"),
    };
    if !matches!(typed.ty.as_ref(), syn::Type::Reference(_)) {
        bail!(typed.ty, "the raw value must be taken as `&str`");
    }

    let output = match &sig.output {
        syn::ReturnType::Type(_, ty) => match last_segment(ty).as_deref() {
            Some("String") => Output::Plain,
            Some("Result") => Output::Fallible,
            _ => bail!(ty, "expected `String` or `Result<String, TransformError>`"),
        },
        syn::ReturnType::Default => {
            bail!(sig, "expected a return type of `String` or `Result<String, TransformError>`")
        }
    };

    let attrs = &func.attrs;
    let vis = &func.vis;
    let ident = &sig.ident;
    let name = match meta.name {
        Some(name) => name.value(),
        None => ident.to_string(),
    };

    let mut inner = func.clone();
    inner.attrs.clear();
    inner.vis = syn::Visibility::Inherited;

    let call = match output {
        Output::Plain => quote! { ::core::result::Result::Ok(#ident(raw)) },
        Output::Fallible => quote! { #ident(raw) },
    };

    Ok(quote! {
        #(#attrs)*
        #vis fn #ident() -> ::transmemo::StaticEngine {
            #inner

            fn adapt(raw: &str) -> ::core::result::Result<
                ::std::string::String,
                ::transmemo::TransformError,
            > {
                #call
            }

            ::transmemo::StaticEngine::new(#name, adapt)
        }
    })
}

/// The name of the last path segment of a type, e.g. `Result` for
/// `std::result::Result<String, E>`.
fn last_segment(ty: &syn::Type) -> Option<String> {
    match ty {
        syn::Type::Path(path) => path.path.segments.last().map(|seg| seg.ident.to_string()),
        _ => None,
    }
}
