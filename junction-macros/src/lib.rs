//! Derive macros shared by `junction-core`: `ToQueryString` (struct →
//! percent-encoded query string) and `Partial` (struct → all-`Option`
//! sibling, the shape hand-written for [`crate::storage::ConnectorRecordUpdate`]-like
//! partial-update payloads before this macro existed).
//!
//! `ToQueryString` percent-encodes every field value it emits — OAuth
//! authorize URLs are the only place this crate builds a query string by
//! hand (`OAuthEngine::generate_auth_url`'s fixed fields), and an
//! unescaped space or `&` in a scope/redirect value would silently corrupt
//! the URL.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Fields, GenericArgument, PathArguments, Type};

const SUPPORTED_OPTION_TYPES: [&str; 5] =
    ["Option", "::core::option::Option", "core::option::Option", "::std::option::Option", "std::option::Option"];

fn unwrap_type_twice(ty: &Type) -> (Option<String>, Option<String>) {
    if let Type::Path(type_path) = ty {
        let raw_first_segment_path = type_path.path.segments.iter().fold(
            if type_path.path.leading_colon.is_some() { "::".to_string() } else { "".to_string() },
            |acc, el| acc + &el.ident.to_string() + "::",
        );

        let args = match type_path.path.segments.len() {
            0 => &PathArguments::None,
            1 => &type_path.path.segments[0].arguments,
            2.. => &type_path.path.segments[type_path.path.segments.len() - 1].arguments,
        };

        let first_segment_path = raw_first_segment_path[..raw_first_segment_path.len() - 2].to_owned();

        if let PathArguments::AngleBracketed(path_args) = args {
            let inner = &path_args.args[0];
            if let GenericArgument::Type(Type::Path(inner_type_path)) = inner {
                let raw_second_segment_path = inner_type_path.path.segments.iter().fold(
                    if inner_type_path.path.leading_colon.is_some() { "::".to_string() } else { "".to_string() },
                    |acc, el| acc + &el.ident.to_string() + "::",
                );
                let second_segment_path = raw_second_segment_path[..raw_second_segment_path.len() - 2].to_owned();
                return (Some(first_segment_path), Some(second_segment_path));
            }
        } else {
            return (Some(first_segment_path), None);
        };

        (Some(first_segment_path), None)
    } else {
        (None, None)
    }
}

/// Derives `fn to_query_string(&self) -> String`, a leading-`?` query string
/// with every value percent-encoded. `Option<T>` fields are omitted when
/// `None`; `Vec<T>`/`Option<Vec<T>>` fields repeat the key once per item.
#[proc_macro_derive(ToQueryString)]
pub fn to_query_string_derive(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = input.ident;

    let fields = match input.data {
        Data::Struct(data_struct) => match data_struct.fields {
            Fields::Named(fields_named) => fields_named.named,
            _ => {
                return TokenStream::from(quote! {
                    compile_error!("ToQueryString can only be derived for structs with named fields.");
                })
            }
        },
        _ => {
            return TokenStream::from(quote! {
                compile_error!("ToQueryString can only be derived for structs.");
            })
        }
    };

    let field_processings = fields.iter().map(|field| {
        let Some(ref ident) = field.ident else {
            return quote! {
                compile_error!("ToQueryString requires named fields.");
            };
        };

        let field_name = ident;
        let field_name_str = ident.to_string();

        match unwrap_type_twice(&field.ty) {
            (Some(outer), Some(ref inner)) if SUPPORTED_OPTION_TYPES.contains(&&*outer) && inner == "Vec" => {
                quote! {
                    if let Some(ref v) = self.#field_name {
                        for item in v {
                            let encoded = ::percent_encoding::utf8_percent_encode(&item.to_string(), ::percent_encoding::NON_ALPHANUMERIC);
                            query.push_str(&format!("{}={}&", #field_name_str, encoded));
                        }
                    }
                }
            }
            (Some(outer), _) if SUPPORTED_OPTION_TYPES.contains(&&*outer) => {
                quote! {
                    if let Some(ref item) = self.#field_name {
                        let encoded = ::percent_encoding::utf8_percent_encode(&item.to_string(), ::percent_encoding::NON_ALPHANUMERIC);
                        query.push_str(&format!("{}={}&", #field_name_str, encoded));
                    }
                }
            }
            (Some(ref outer), _) if outer == "Vec" => {
                quote! {
                    for item in &self.#field_name {
                        let encoded = ::percent_encoding::utf8_percent_encode(&item.to_string(), ::percent_encoding::NON_ALPHANUMERIC);
                        query.push_str(&format!("{}={}&", #field_name_str, encoded));
                    }
                }
            }
            (_, _) => {
                quote! {
                    let encoded = ::percent_encoding::utf8_percent_encode(&self.#field_name.to_string(), ::percent_encoding::NON_ALPHANUMERIC);
                    query.push_str(&format!("{}={}&", #field_name_str, encoded));
                }
            }
        }
    });

    let expanded = quote! {
        impl #name {
            pub fn to_query_string(&self) -> String {
                let mut query = String::from("?");
                #(#field_processings)*
                query.pop();
                query
            }
        }
    };

    TokenStream::from(expanded)
}

/// Derives `Partial<Name>`: the same fields, each wrapped in `Option<T>`.
#[proc_macro_derive(Partial)]
pub fn derive_partial(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let struct_name = &input.ident;
    let partial_struct_name = syn::Ident::new(&format!("Partial{}", struct_name), struct_name.span());

    let fields = match input.data {
        Data::Struct(ref data_struct) => match data_struct.fields {
            Fields::Named(ref fields) => fields
                .named
                .iter()
                .map(|f| {
                    let name = &f.ident;
                    let ty = &f.ty;
                    quote! { pub #name: Option<#ty> }
                })
                .collect::<Vec<_>>(),
            _ => panic!("Partial can only be derived for structs with named fields"),
        },
        _ => panic!("Partial can only be derived for structs"),
    };

    let expanded = quote! {
        pub struct #partial_struct_name {
            #(#fields),*
        }
    };

    TokenStream::from(expanded)
}
