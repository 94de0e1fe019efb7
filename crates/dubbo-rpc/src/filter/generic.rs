//! Generic invocation on the provider side.
//!
//! A consumer without the service's types calls
//! `$invoke(method, parameter_types, args)`. The `generic_service` filter
//! rewrites such a call into a call to `method`, and hands back typed
//! objects as maps carrying their class under the `class` key.

use async_trait::async_trait;
use dubbo_proto::Value;
use tracing::debug;

use super::{Filter, Next};
use crate::invocation::Invocation;
use crate::invoker::Invoker;
use crate::result::RpcResult;

pub const GENERIC_SERVICE_FILTER: &str = "generic_service";

/// Method name of a generic call.
pub const GENERIC_INVOKE: &str = "$invoke";

const GENERIC_ATTRIBUTE: &str = "generic.invoke";

/// Turns `$invoke` calls into calls to the named method.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericServiceFilter;

impl GenericServiceFilter {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Filter for GenericServiceFilter {
    async fn invoke(&self, next: Next<'_>, invocation: &mut Invocation) -> RpcResult {
        if let Some((method, args, arg_types)) = unpack(invocation) {
            debug!(
                service = %next.url().service_key(),
                method = %method,
                "generic call"
            );
            invocation.redirect(method, args, arg_types);
            invocation.set_attribute(GENERIC_ATTRIBUTE, true);
        }
        next.run(invocation).await
    }

    async fn on_response(
        &self,
        result: RpcResult,
        _invoker: &dyn Invoker,
        invocation: &mut Invocation,
    ) -> RpcResult {
        if invocation.attribute::<bool>(GENERIC_ATTRIBUTE).is_none() {
            return result;
        }
        invocation.remove_attribute(GENERIC_ATTRIBUTE);
        result.map_value(generalize)
    }
}

/// Splits `$invoke(method, types, args)`. Anything else is left alone.
fn unpack(invocation: &Invocation) -> Option<(String, Vec<Value>, Option<String>)> {
    if invocation.method() != GENERIC_INVOKE {
        return None;
    }
    let [Value::String(method), types, args] = invocation.args() else {
        return None;
    };
    let args = match args {
        Value::List { items, .. } => items.clone(),
        Value::Null => Vec::new(),
        _ => return None,
    };
    let arg_types = match types {
        Value::List { items, .. } => Some(
            items
                .iter()
                .map(|t| match t {
                    Value::String(name) => Some(descriptor(name)),
                    _ => None,
                })
                .collect::<Option<String>>()?,
        ),
        _ => None,
    };
    Some((method.clone(), args, arg_types))
}

/// JVM descriptor for a Java type name such as `int`, `java.lang.String`
/// or `long[]`. Names already in descriptor form pass through.
fn descriptor(name: &str) -> String {
    if let Some(element) = name.strip_suffix("[]") {
        return format!("[{}", descriptor(element));
    }
    match name {
        "void" => "V".to_owned(),
        "boolean" => "Z".to_owned(),
        "byte" => "B".to_owned(),
        "char" => "C".to_owned(),
        "short" => "S".to_owned(),
        "int" => "I".to_owned(),
        "long" => "J".to_owned(),
        "float" => "F".to_owned(),
        "double" => "D".to_owned(),
        _ if name.starts_with('[') || (name.starts_with('L') && name.ends_with(';')) => {
            name.to_owned()
        }
        _ => format!("L{};", name.replace('.', "/")),
    }
}

/// Replaces typed objects with maps, recursively.
fn generalize(value: Value) -> Value {
    match value {
        Value::Object { class, fields } => {
            let mut entries = Vec::with_capacity(fields.len() + 1);
            entries.push((Value::from("class"), Value::String(class)));
            entries.extend(
                fields
                    .into_iter()
                    .map(|(name, value)| (Value::String(name), generalize(value))),
            );
            Value::Map {
                class: None,
                entries,
            }
        }
        Value::List { class, items } => Value::List {
            class,
            items: items.into_iter().map(generalize).collect(),
        },
        Value::Map { class, entries } => Value::Map {
            class,
            entries: entries
                .into_iter()
                .map(|(k, v)| (generalize(k), generalize(v)))
                .collect(),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use rstest::rstest;

    use super::*;
    use crate::filter::FilterChain;
    use crate::invoker::BaseInvoker;
    use crate::url::Url;

    /// Records what reached it and answers with a fixed value.
    struct Recorder {
        base: BaseInvoker,
        seen: Mutex<Option<(String, Vec<Value>, String)>>,
        reply: Value,
    }

    #[async_trait]
    impl Invoker for Recorder {
        fn url(&self) -> &Url {
            self.base.url()
        }

        fn is_available(&self) -> bool {
            true
        }

        async fn invoke(&self, invocation: &mut Invocation) -> RpcResult {
            *self.seen.lock() = Some((
                invocation.method().to_owned(),
                invocation.args().to_vec(),
                invocation.arg_types(),
            ));
            RpcResult::ok(self.reply.clone())
        }

        fn destroy(&self) {}
    }

    fn chain(reply: Value) -> (Arc<Recorder>, FilterChain) {
        let recorder = Arc::new(Recorder {
            base: BaseInvoker::new(Url::parse("dubbo://h:1/svc").unwrap()),
            seen: Mutex::new(None),
            reply,
        });
        let filter: Arc<dyn Filter> = Arc::new(GenericServiceFilter::new());
        let chain = FilterChain::new(
            recorder.clone(),
            vec![(GENERIC_SERVICE_FILTER.into(), filter)],
        );
        (recorder, chain)
    }

    fn user() -> Value {
        Value::Object {
            class: "com.example.User".into(),
            fields: vec![
                ("name".into(), Value::from("ada")),
                ("age".into(), Value::Int(36)),
            ],
        }
    }

    #[tokio::test]
    async fn generic_call_reaches_the_named_method() {
        let (recorder, chain) = chain(user());
        let mut invocation = Invocation::new(
            GENERIC_INVOKE,
            vec![
                Value::from("find"),
                Value::list(vec![Value::from("java.lang.String"), Value::from("int")]),
                Value::list(vec![Value::from("ada"), Value::Int(1)]),
            ],
        );

        let result = chain.invoke(&mut invocation).await;

        let seen = recorder.seen.lock().clone().unwrap();
        assert_eq!(seen.0, "find");
        assert_eq!(seen.1, vec![Value::from("ada"), Value::Int(1)]);
        assert_eq!(seen.2, "Ljava/lang/String;I");
        assert_eq!(
            result.into_result(),
            Ok(Value::Map {
                class: None,
                entries: vec![
                    (Value::from("class"), Value::from("com.example.User")),
                    (Value::from("name"), Value::from("ada")),
                    (Value::from("age"), Value::Int(36)),
                ],
            })
        );
    }

    #[tokio::test]
    async fn ordinary_calls_pass_through_untouched() {
        let (recorder, chain) = chain(user());
        let mut invocation = Invocation::new("find", vec![Value::from("ada")]);

        let result = chain.invoke(&mut invocation).await;

        assert_eq!(recorder.seen.lock().clone().unwrap().0, "find");
        assert_eq!(result.into_result(), Ok(user()));
    }

    #[tokio::test]
    async fn malformed_generic_calls_are_not_rewritten() {
        let (recorder, chain) = chain(Value::Null);
        let mut invocation = Invocation::new(GENERIC_INVOKE, vec![Value::Int(1)]);

        chain.invoke(&mut invocation).await;

        assert_eq!(recorder.seen.lock().clone().unwrap().0, GENERIC_INVOKE);
    }

    #[tokio::test]
    async fn missing_types_fall_back_to_the_values() {
        let (recorder, chain) = chain(Value::Null);
        let mut invocation = Invocation::new(
            GENERIC_INVOKE,
            vec![
                Value::from("ping"),
                Value::Null,
                Value::list(vec![Value::Long(7)]),
            ],
        );

        chain.invoke(&mut invocation).await;

        let seen = recorder.seen.lock().clone().unwrap();
        assert_eq!((seen.0.as_str(), seen.2.as_str()), ("ping", "J"));
    }

    #[rstest]
    #[case("int", "I")]
    #[case("boolean", "Z")]
    #[case("java.lang.String", "Ljava/lang/String;")]
    #[case("long[]", "[J")]
    #[case("com.example.User[][]", "[[Lcom/example/User;")]
    #[case("Ljava/util/Map;", "Ljava/util/Map;")]
    #[case("[I", "[I")]
    fn java_names_become_descriptors(#[case] name: &str, #[case] expected: &str) {
        assert_eq!(descriptor(name), expected);
    }

    #[test]
    fn nested_objects_are_generalized() {
        let nested = Value::list(vec![user(), Value::Int(2)]);
        let Value::List { items, .. } = generalize(nested) else {
            panic!("expected a list");
        };
        assert!(matches!(items[0], Value::Map { .. }));
        assert_eq!(items[1], Value::Int(2));
    }
}
