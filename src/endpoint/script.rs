//! Endpoints over a script context.
//!
//! The host side binds its inbound channel as the script global
//! [`INBOUND_CHANNEL`] and sends outbound calls through the script object
//! [`OUTBOUND_CHANNEL`]. Both globals speak the [`channel_descriptor`]
//! capability set, so endpoint traffic is plain string calls through the
//! binder.

use super::call::{encode_failure, EncodedResult};
use super::{CallChannel, Endpoint, EventListener, ServiceTypeInfo};
use crate::binder::{HostService, MethodDescriptor, RemoteProxy, ScriptContext, ServiceDescriptor};
use crate::error::{BridgeError, HostException, Result};
use crate::marshal::DeclaredType;
use crate::value::HostValue;
use std::sync::Arc;
use tracing::{info, warn};

/// Global through which script calls the host
pub const INBOUND_CHANNEL: &str = "bridge_inboundChannel";

/// Global through which the host calls script
pub const OUTBOUND_CHANNEL: &str = "bridge_outboundChannel";

/// Capability set of both channel globals
pub fn channel_descriptor() -> ServiceDescriptor {
    ServiceDescriptor::new("CallChannel")
        .method(
            MethodDescriptor::new("serviceNamesArray").returns(DeclaredType::array(DeclaredType::String)),
        )
        .method(
            MethodDescriptor::new("serviceType")
                .param(DeclaredType::String)
                .returns(DeclaredType::nullable(DeclaredType::String)),
        )
        .method(
            MethodDescriptor::new("call")
                .param(DeclaredType::String)
                .returns(DeclaredType::String),
        )
        .method(
            MethodDescriptor::new("disconnect")
                .param(DeclaredType::String)
                .returns(DeclaredType::Boolean),
        )
}

/// Host channel exposed to script
struct ChannelService {
    channel: Arc<dyn CallChannel>,
}

impl HostService for ChannelService {
    fn invoke(&self, method: &str, args: Vec<HostValue>) -> std::result::Result<HostValue, HostException> {
        let text = |index: usize| {
            args.get(index).and_then(HostValue::as_str).ok_or_else(|| {
                HostException::new(
                    "IllegalArgumentException",
                    format!("{} expects a string argument", method),
                )
            })
        };
        match method {
            "serviceNamesArray" => Ok(HostValue::Array(
                self.channel
                    .service_names()
                    .into_iter()
                    .map(HostValue::String)
                    .collect(),
            )),
            "serviceType" => match self.channel.service_type(text(0)?) {
                Some(info) => serde_json::to_string(&info)
                    .map(HostValue::String)
                    .map_err(HostException::from_error),
                None => Ok(HostValue::Null),
            },
            "call" => Ok(HostValue::String(self.channel.call(text(0)?))),
            "disconnect" => Ok(HostValue::Bool(self.channel.disconnect(text(0)?))),
            other => Err(HostException::new(
                "UnsupportedOperation",
                format!("CallChannel has no method {}", other),
            )),
        }
    }
}

/// Script channel seen from the host
struct ScriptCallChannel {
    proxy: RemoteProxy,
}

impl ScriptCallChannel {
    fn call_script(&self, method: &str, args: Vec<HostValue>) -> Result<HostValue> {
        self.proxy.call(method, args).map_err(|err| match err {
            BridgeError::NullContext => BridgeError::Closed("script context is closed".to_string()),
            other => other,
        })
    }
}

impl CallChannel for ScriptCallChannel {
    fn service_names(&self) -> Vec<String> {
        match self.call_script("serviceNamesArray", Vec::new()) {
            Ok(HostValue::Array(items)) => items
                .into_iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            Ok(_) => Vec::new(),
            Err(err) => {
                warn!(error = %err, "Failed to list script services");
                Vec::new()
            }
        }
    }

    fn service_type(&self, name: &str) -> Option<ServiceTypeInfo> {
        match self.call_script("serviceType", vec![name.into()]) {
            Ok(HostValue::String(json)) => serde_json::from_str(&json).ok(),
            Ok(_) => None,
            Err(err) => {
                warn!(error = %err, name, "Failed to read script service type");
                None
            }
        }
    }

    fn call(&self, encoded_call: &str) -> String {
        let failure = match self.call_script("call", vec![encoded_call.into()]) {
            Ok(HostValue::String(result)) => return result,
            Ok(other) => BridgeError::Serialization(format!(
                "script channel returned {} instead of a string",
                other.type_name()
            )),
            Err(err) => err,
        };
        serde_json::to_string(&EncodedResult::Failure(encode_failure(&failure))).unwrap_or_default()
    }

    fn disconnect(&self, name: &str) -> bool {
        matches!(
            self.call_script("disconnect", vec![name.into()]),
            Ok(HostValue::Bool(true))
        )
    }
}

/// Connect `endpoint` to the script side of `context`.
///
/// The script must already define [`OUTBOUND_CHANNEL`]; [`INBOUND_CHANNEL`]
/// is bound here.
pub fn connect_script(endpoint: &Endpoint, context: &ScriptContext) -> Result<()> {
    let descriptor = channel_descriptor();
    context.bind(
        INBOUND_CHANNEL,
        &descriptor,
        Arc::new(ChannelService {
            channel: endpoint.inbound_channel(),
        }),
    )?;
    let proxy = context.proxy(OUTBOUND_CHANNEL, &descriptor)?;
    endpoint.connect(Arc::new(ScriptCallChannel { proxy }));
    info!("Endpoint connected to script context");
    Ok(())
}

/// Create an endpoint from the context's endpoint options and connect it
/// to the script side.
pub fn script_endpoint(context: &ScriptContext, listener: Arc<dyn EventListener>) -> Result<Endpoint> {
    let endpoint = Endpoint::with_listener(context.config().endpoint.clone(), listener)?;
    connect_script(&endpoint, context)?;
    Ok(endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BridgeConfig, EndpointConfig};
    use crate::endpoint::{NoopListener, OutboundCallHandler, ServiceAdapter, ServiceFunction};
    use crate::engine::{Js, JsError, Member, ScriptFunction, ScriptedEngine};
    use crate::value::ScriptValue;

    struct Greeter;

    struct GreeterAdapter;

    impl ServiceAdapter for GreeterAdapter {
        type Service = Greeter;
        type Outbound = OutboundCallHandler;

        fn serial_name(&self) -> &str {
            "Greeter"
        }

        fn functions(&self) -> Vec<ServiceFunction<Greeter>> {
            vec![ServiceFunction::returning(
                "fun greet(String): String",
                |_: &Greeter, (name,): (String,)| Ok(format!("Hello, {}", name)),
            )]
        }

        fn outbound_service(&self, handler: OutboundCallHandler) -> OutboundCallHandler {
            handler
        }
    }

    fn forward(method: &'static str, line: u32) -> (&'static str, Member) {
        let function = ScriptFunction::new(method, "channel.js", line, move |js: &mut Js, args: Vec<ScriptValue>| -> std::result::Result<ScriptValue, JsError> {
            js.call(INBOUND_CHANNEL, method, args)
        });
        (method, Member::Function(function))
    }

    /// A context whose outbound channel loops back into the inbound one
    fn loopback() -> ScriptContext {
        loopback_with(BridgeConfig::default())
    }

    fn loopback_with(config: BridgeConfig) -> ScriptContext {
        let engine = Arc::new(ScriptedEngine::new());
        engine.register("install", |js, _| {
            js.define_object(
                OUTBOUND_CHANNEL,
                vec![
                    forward("serviceNamesArray", 2),
                    forward("serviceType", 3),
                    forward("call", 4),
                    forward("disconnect", 5),
                ],
            )?;
            Ok(ScriptValue::Undefined)
        });
        let context = ScriptContext::with_config(engine, config).unwrap();
        context.evaluate("install").unwrap();
        context
    }

    #[test]
    fn test_calls_cross_the_script_channel() {
        let context = loopback();
        let endpoint = Endpoint::new(EndpointConfig::default()).unwrap();
        connect_script(&endpoint, &context).unwrap();
        endpoint.bind("greeter", Arc::new(Greeter), &GreeterAdapter).unwrap();

        let greeter = endpoint.take("greeter", &GreeterAdapter).unwrap();
        let greeting: String = greeter.call(0, ("Jesse",)).unwrap();
        assert_eq!(greeting, "Hello, Jesse");
        assert_eq!(endpoint.remote_service_names().unwrap(), vec!["greeter".to_string()]);

        greeter.close();
        context.close();
    }

    #[test]
    fn test_script_endpoint_uses_context_options() {
        let config = BridgeConfig::default()
            .with_endpoint(EndpointConfig::default().with_pass_by_reference_prefix("guest/"));
        let context = loopback_with(config);
        let endpoint = script_endpoint(&context, Arc::new(NoopListener)).unwrap();
        assert_eq!(endpoint.config().pass_by_reference_prefix, "guest/");

        endpoint.bind("greeter", Arc::new(Greeter), &GreeterAdapter).unwrap();
        let greeter = endpoint.take("greeter", &GreeterAdapter).unwrap();
        let greeting: String = greeter.call(0, ("Ada",)).unwrap();
        assert_eq!(greeting, "Hello, Ada");
        greeter.close();
        context.close();
    }

    #[test]
    fn test_closed_context_closes_channel() {
        let context = loopback();
        let endpoint = Endpoint::new(EndpointConfig::default()).unwrap();
        connect_script(&endpoint, &context).unwrap();
        endpoint.bind("greeter", Arc::new(Greeter), &GreeterAdapter).unwrap();
        let greeter = endpoint.take("greeter", &GreeterAdapter).unwrap();

        context.close();
        let err = greeter.call::<_, String>(0, ("Jesse",)).unwrap_err();
        assert!(matches!(err, BridgeError::Closed(_)), "{err:?}");
        greeter.close();
    }

    #[test]
    fn test_channel_globals_must_exist() {
        let context = ScriptContext::create(Arc::new(ScriptedEngine::new())).unwrap();
        let endpoint = Endpoint::new(EndpointConfig::default()).unwrap();
        let err = connect_script(&endpoint, &context).unwrap_err();
        assert_eq!(
            err.to_string(),
            "A global JavaScript object called bridge_outboundChannel was not found"
        );
        context.close();
    }
}
