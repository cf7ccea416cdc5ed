//! # testctx-macros
//!
//! 提供 `#[suite]` 属性宏：扫描 `impl` 块中形如 `fn test_x(&self, ctx: Context, t: T)` 的方法，
//! 在编译期生成 `testctx::suite::Suite` 实现，使包装器可以按名称前缀批量运行它们。
//! 展开分为三个阶段：解析属性参数、筛选候选方法、按包装器类型分组生成实现。

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::punctuated::Punctuated;
use syn::spanned::Spanned;
use syn::{
    FnArg, GenericArgument, Ident, ImplItem, ImplItemFn, ItemImpl, Meta, PathArguments, PathSegment,
    Result as SynResult, ReturnType, Token, Type, parse_macro_input,
};

#[proc_macro_attribute]
/// 教案级说明：
/// - **意图（Why）**：替代运行时反射，让套件方法在编译期登记，声明顺序即运行顺序。
/// - **逻辑（How）**：先由 `parse_prefixes` 解析前缀，再由 `collect_methods` 选出候选方法，
///   最后 `generate_impls` 为每种包装器类型各生成一个 `Suite<U>` 实现。
/// - **契约（What）**：
///   - 候选方法须满足：`&self` 接收者、恰好两个参数且第一个参数类型名为 `Context`、
///     第二个参数为 `T`、`B` 或 `W<..>`、无返回值、无泛型参数、非 `async`，并且名称以某个前缀开头；
///   - 形状不符的方法原样保留、静默跳过；
///   - 第二个参数解析出的运行单元类型决定方法归入哪个 `Suite<U>` 实现，
///     `T` 与 `W<TestUnit>` 归入同一实现。
/// - **权衡（Trade-offs）**：只解析签名形状而不做类型检查，错误签名由生成代码在类型层面报错。
pub fn suite(attr: TokenStream, item: TokenStream) -> TokenStream {
    let item_impl = parse_macro_input!(item as ItemImpl);

    match parse_prefixes(attr).and_then(|prefixes| generate_impls(&prefixes, item_impl)) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

/// 教案级说明：
/// - **意图**：允许调用方限定参与登记的方法名前缀。
/// - **逻辑**：属性为空时返回默认前缀；否则要求 `prefixes(...)` 形式，元素为标识符。
/// - **契约**：成功返回非空前缀列表；语法错误转化为 `syn::Error`。
fn parse_prefixes(attr: TokenStream) -> SynResult<Vec<String>> {
    if attr.is_empty() {
        return Ok(default_prefixes());
    }

    let meta = syn::parse::<Meta>(attr)?;
    match meta {
        Meta::List(list) if list.path.is_ident("prefixes") => {
            let nested: Punctuated<Ident, Token![,]> =
                list.parse_args_with(Punctuated::parse_terminated)?;
            let prefixes: Vec<String> = nested.iter().map(Ident::to_string).collect();
            if prefixes.is_empty() {
                Ok(default_prefixes())
            } else {
                Ok(prefixes)
            }
        }
        other => Err(syn::Error::new(
            other.span(),
            "suite 属性仅支持 prefixes(...)",
        )),
    }
}

fn default_prefixes() -> Vec<String> {
    ["test", "bench"].iter().map(|p| (*p).to_owned()).collect()
}

/// 判断方法签名是否为套件方法形状，是则返回包装器对应的运行单元类型。
fn candidate_unit(method: &ImplItemFn) -> Option<proc_macro2::TokenStream> {
    let sig = &method.sig;
    if sig.asyncness.is_some()
        || !sig.generics.params.is_empty()
        || !matches!(sig.output, ReturnType::Default)
    {
        return None;
    }

    let mut inputs = sig.inputs.iter();
    match inputs.next()? {
        FnArg::Receiver(receiver) if receiver.reference.is_some() && receiver.mutability.is_none() => {}
        _ => return None,
    }
    let ctx = match inputs.next()? {
        FnArg::Typed(arg) => &arg.ty,
        FnArg::Receiver(_) => return None,
    };
    let wrapper = match inputs.next()? {
        FnArg::Typed(arg) => &arg.ty,
        FnArg::Receiver(_) => return None,
    };
    if inputs.next().is_some() || !is_context(ctx) {
        return None;
    }
    wrapper_unit(wrapper)
}

fn last_segment(ty: &Type) -> Option<&PathSegment> {
    match ty {
        Type::Path(path) if path.qself.is_none() => path.path.segments.last(),
        _ => None,
    }
}

fn is_context(ty: &Type) -> bool {
    last_segment(ty).is_some_and(|segment| segment.ident == "Context" && segment.arguments.is_empty())
}

/// 把包装器类型解析为运行单元类型。
///
/// `T`/`B` 别名与宿主单元名统一映射到 `::testctx::host` 下的完整路径，使不同写法落入同一个实现；
/// `W<X>` 取其类型实参；其余类型返回 `None`，对应方法不登记。
fn wrapper_unit(ty: &Type) -> Option<proc_macro2::TokenStream> {
    let segment = last_segment(ty)?;
    match &segment.arguments {
        PathArguments::None if segment.ident == "T" => Some(quote!(::testctx::host::TestUnit)),
        PathArguments::None if segment.ident == "B" => Some(quote!(::testctx::host::BenchUnit)),
        PathArguments::AngleBracketed(args) if segment.ident == "W" && args.args.len() == 1 => {
            match args.args.first()? {
                GenericArgument::Type(inner) => Some(canonical_unit(inner)),
                _ => None,
            }
        }
        _ => None,
    }
}

fn canonical_unit(ty: &Type) -> proc_macro2::TokenStream {
    match last_segment(ty) {
        Some(segment) if segment.arguments.is_empty() && segment.ident == "TestUnit" => {
            quote!(::testctx::host::TestUnit)
        }
        Some(segment) if segment.arguments.is_empty() && segment.ident == "BenchUnit" => {
            quote!(::testctx::host::BenchUnit)
        }
        _ => quote!(#ty),
    }
}

/// 教案级说明：
/// - **意图**：为 `impl` 块生成一组 `Suite` 实现并保留原始代码。
/// - **逻辑**：
///   1. 遍历方法，按前缀与形状筛选；
///   2. 以解析出的运行单元类型为键分组，组内保持声明顺序，组间按首次出现顺序；
///   3. 每组生成 `impl Suite<Unit> for Self`。
/// - **契约**：没有候选方法时仅输出原始 `impl` 块。
fn generate_impls(prefixes: &[String], item_impl: ItemImpl) -> SynResult<proc_macro2::TokenStream> {
    if let Some((_, path, _)) = &item_impl.trait_ {
        return Err(syn::Error::new(
            path.span(),
            "suite 只能用于固有 impl 块",
        ));
    }

    let mut groups: Vec<(String, proc_macro2::TokenStream, Vec<Ident>)> = Vec::new();
    for item in &item_impl.items {
        let ImplItem::Fn(method) = item else {
            continue;
        };
        let name = method.sig.ident.to_string();
        if !prefixes.iter().any(|prefix| name.starts_with(prefix.as_str())) {
            continue;
        }
        let Some(unit) = candidate_unit(method) else {
            continue;
        };
        let key = unit.to_string();
        match groups.iter_mut().find(|(existing, _, _)| *existing == key) {
            Some((_, _, methods)) => methods.push(method.sig.ident.clone()),
            None => groups.push((key, unit, vec![method.sig.ident.clone()])),
        }
    }

    let self_ty = &item_impl.self_ty;
    let (impl_generics, _, where_clause) = item_impl.generics.split_for_impl();
    let generated = groups.iter().map(|(_, unit, methods)| {
        let names = methods
            .iter()
            .map(|ident| syn::LitStr::new(&ident.to_string(), Span::call_site()));
        quote! {
            impl #impl_generics ::testctx::suite::Suite<#unit> for #self_ty #where_clause {
                fn methods() -> ::std::vec::Vec<::testctx::suite::SuiteMethod<Self, #unit>> {
                    ::std::vec![
                        #(::testctx::suite::SuiteMethod::new(#names, Self::#methods),)*
                    ]
                }
            }
        }
    });

    Ok(quote! {
        #item_impl
        #(#generated)*
    })
}
