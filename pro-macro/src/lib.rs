use quote::quote;
use syn::{parse_macro_input, spanned::Spanned, Data, DeriveInput, Error, Fields};

/// Derive `From<Inner>`, `Deref` and `DerefMut` for a struct wrapping a
/// single field. Works for both named and unnamed single-field structs.
#[proc_macro_derive(FromInner)]
pub fn from_inner(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;

    proc_macro::TokenStream::from(match input.data {
        Data::Struct(ref data) => match data.fields {
            Fields::Named(ref fields) => {
                if fields.named.len() != 1 {
                    Error::new(input.span(), "expected exactly one field").to_compile_error()
                } else {
                    let field = fields.named.first().expect("length checked above");
                    let t = &field.ty;
                    let ident = field.ident.as_ref().expect("named field has an ident");
                    quote! {
                        impl From<#t> for #name {
                            fn from(value: #t) -> Self {
                                Self { #ident: value }
                            }
                        }

                        impl std::ops::Deref for #name {
                            type Target = #t;
                            fn deref(&self) -> &Self::Target {
                                &self.#ident
                            }
                        }

                        impl std::ops::DerefMut for #name {
                            fn deref_mut(&mut self) -> &mut Self::Target {
                                &mut self.#ident
                            }
                        }
                    }
                }
            }
            Fields::Unnamed(ref fields) => {
                if fields.unnamed.len() != 1 {
                    Error::new(input.span(), "expected exactly one field").to_compile_error()
                } else {
                    let t = &fields.unnamed.first().expect("length checked above").ty;
                    quote! {
                        impl From<#t> for #name {
                            fn from(value: #t) -> Self {
                                Self(value)
                            }
                        }

                        impl std::ops::Deref for #name {
                            type Target = #t;
                            fn deref(&self) -> &Self::Target {
                                &self.0
                            }
                        }

                        impl std::ops::DerefMut for #name {
                            fn deref_mut(&mut self) -> &mut Self::Target {
                                &mut self.0
                            }
                        }
                    }
                }
            }
            _ => Error::new(input.span(), "only named and unnamed structs are supported")
                .to_compile_error(),
        },
        _ => Error::new(input.span(), "only named and unnamed structs are supported")
            .to_compile_error(),
    })
}
