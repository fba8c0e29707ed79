//! Scenario tests for binding host services and proxying script objects.

use anyhow::Result;
use script_bridge::engine::{Member, ScriptFunction};
use script_bridge::trace::{CallFrame, FrameLocation, FrameOrigin};
use script_bridge::{
    BridgeError, DeclaredType, FnService, HostException, HostValue, MethodDescriptor, ScriptContext,
    ScriptValue, ScriptedEngine, ServiceDescriptor,
};
use std::sync::{Arc, OnceLock, Weak};

fn divider() -> (ServiceDescriptor, FnService) {
    let descriptor = ServiceDescriptor::new("Divider").method(
        MethodDescriptor::new("d")
            .param(DeclaredType::Integer)
            .param(DeclaredType::Double)
            .returns(DeclaredType::Double),
    );
    let service = FnService::new().method("d", |args| {
        let i = args[0].as_int().unwrap_or(1);
        let v = args[1].as_double().unwrap_or(0.0);
        Ok(HostValue::Double(v / f64::from(i)))
    });
    (descriptor, service)
}

fn getter() -> ServiceDescriptor {
    ServiceDescriptor::new("Getter").method(MethodDescriptor::new("getValue").returns(DeclaredType::Integer))
}

#[test]
fn test_primitive_round_trip() -> Result<()> {
    let engine = Arc::new(ScriptedEngine::new());
    engine.register("d(2, 6.28318)", |js, _| {
        js.call("calc", "d", vec![ScriptValue::Int(2), ScriptValue::Float(6.28318)])
    });
    let context = ScriptContext::create(engine)?;
    let (descriptor, service) = divider();
    context.bind("calc", &descriptor, Arc::new(service))?;

    let result = context.evaluate("d(2, 6.28318)")?;
    let value = result.as_double().expect("double result");
    assert!((value - 3.14159).abs() < 1e-9);
    context.close();
    Ok(())
}

#[test]
fn test_missing_member() -> Result<()> {
    let engine = Arc::new(ScriptedEngine::new());
    engine.register("define", |js, _| {
        let other = ScriptFunction::new("getOtherValue", "value.js", 1, |_, _| Ok(1.into()));
        js.define_object("value", vec![("getOtherValue", Member::Function(other))])?;
        Ok(ScriptValue::Undefined)
    });
    let context = ScriptContext::create(engine)?;
    context.evaluate("define")?;

    let err = context.proxy("value", &getter()).unwrap_err();
    assert!(matches!(err, BridgeError::Shape(_)));
    assert!(err.to_string().contains("value has no method called getValue"), "{err}");
    context.close();
    Ok(())
}

#[test]
fn test_unsupported_type_is_never_registered() -> Result<()> {
    let context = ScriptContext::create(Arc::new(ScriptedEngine::new()))?;
    let descriptor = ServiceDescriptor::new("Calendar").method(
        MethodDescriptor::new("format")
            .param(DeclaredType::named("Date"))
            .returns(DeclaredType::String),
    );

    let err = context
        .bind("calendar", &descriptor, Arc::new(FnService::new()))
        .unwrap_err();
    match &err {
        BridgeError::Unsupported { type_name, .. } => assert_eq!(type_name, "Date"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        context.evaluate("calendar"),
        Err(BridgeError::ScriptRuntime(_))
    ));
    context.close();
    Ok(())
}

#[test]
fn test_proxy_after_close() -> Result<()> {
    let engine = Arc::new(ScriptedEngine::new());
    engine.register("define", |js, _| {
        let f = ScriptFunction::new("getValue", "value.js", 1, |_, _| Ok(7.into()));
        js.define_object("value", vec![("getValue", Member::Function(f))])?;
        Ok(ScriptValue::Undefined)
    });
    let context = ScriptContext::create(engine.clone())?;
    context.evaluate("define")?;
    let proxy = context.proxy("value", &getter())?;
    assert_eq!(proxy.call_as::<i32>("getValue", vec![])?, 7);

    context.close();
    context.close();
    assert_eq!(engine.live_contexts(), 0);
    assert!(matches!(
        proxy.call("getValue", vec![]),
        Err(BridgeError::NullContext)
    ));
    Ok(())
}

#[test]
fn test_failed_bind_leaves_context_intact() -> Result<()> {
    let engine = Arc::new(ScriptedEngine::new());
    engine.register("var localVar = 'local'", |js, _| {
        js.set("localVar", "local".into())?;
        Ok(ScriptValue::Undefined)
    });
    engine.register("value.method()", |js, _| js.call("value", "method", vec![]));
    let context = ScriptContext::create(engine)?;

    let descriptor = ServiceDescriptor::new("Valued").method(MethodDescriptor::new("method").returns(DeclaredType::String));
    let service = FnService::new().method("method", |_| Ok(HostValue::from("original")));
    context.bind("value", &descriptor, Arc::new(service))?;
    context.evaluate("var localVar = 'local'")?;

    let overloaded = ServiceDescriptor::new("Broken")
        .method(MethodDescriptor::new("method").returns(DeclaredType::String))
        .method(
            MethodDescriptor::new("method")
                .param(DeclaredType::Integer)
                .returns(DeclaredType::String),
        );
    assert!(matches!(
        context.bind("value", &overloaded, Arc::new(FnService::new())),
        Err(BridgeError::Shape(_))
    ));
    assert!(matches!(
        context.bind("value", &descriptor, Arc::new(FnService::new())),
        Err(BridgeError::DuplicateName { .. })
    ));

    assert_eq!(context.evaluate("value.method()")?, HostValue::from("original"));
    assert_eq!(context.evaluate("localVar")?, HostValue::from("local"));
    context.close();
    Ok(())
}

#[test]
fn test_stack_splice_order() -> Result<()> {
    let engine = Arc::new(ScriptedEngine::new());
    engine.register("main()", |js, _| {
        let f2 = ScriptFunction::new("f2", "test.js", 10, |js, _| js.call("service", "fail", vec![]));
        let f1 = ScriptFunction::new("f1", "test.js", 5, move |js, _| js.invoke(&f2, vec![]));
        js.at(2);
        js.invoke(&f1, vec![])
    });
    let context = ScriptContext::create(engine)?;
    let descriptor = ServiceDescriptor::new("Service").method(MethodDescriptor::new("fail"));
    let service = FnService::new().method("fail", |_| Err(HostException::new("IllegalStateException", "boom")));
    context.bind("service", &descriptor, Arc::new(service))?;

    let err = context.evaluate_file("main()", "test.js").unwrap_err();
    let BridgeError::HostRethrow(exception) = err else {
        panic!("expected a host exception, got {err:?}");
    };
    assert_eq!(exception.to_string(), "IllegalStateException: boom");

    let frames = exception.frames();
    assert_eq!(frames.len(), 7, "{}", exception.stack_trace());
    assert_eq!(frames[0].function, "Service.fail");
    assert_eq!(frames[0].origin, FrameOrigin::Host);
    assert_eq!(frames[1], CallFrame::script("f2", "test.js", 10));
    assert_eq!(frames[2], CallFrame::script("f1", "test.js", 5));
    assert_eq!(frames[3], CallFrame::script("<eval>", "test.js", 2));
    assert!(frames[4].is_boundary());
    assert_eq!(frames[5].function, "ScriptContext::evaluate");
    assert_eq!(frames[5].origin, FrameOrigin::Host);
    match &frames[6].location {
        FrameLocation::Source { file, .. } => assert!(file.ends_with("script_context.rs"), "{file}"),
        other => panic!("unexpected caller location {other:?}"),
    }

    let trace = exception.stack_trace();
    assert!(trace.starts_with("IllegalStateException: boom\n\tat Service.fail ("));
    assert!(trace.contains("\tat f2 (test.js:10)\n\tat f1 (test.js:5)\n\tat <eval> (test.js:2)\n"));
    context.close();
    Ok(())
}

#[test]
fn test_script_error_through_proxy() -> Result<()> {
    let engine = Arc::new(ScriptedEngine::new());
    engine.register("define", |js, _| {
        let f = ScriptFunction::new("getValue", "value.js", 3, |js, _| js.throw("no value"));
        js.define_object("value", vec![("getValue", Member::Function(f))])?;
        Ok(ScriptValue::Undefined)
    });
    let context = ScriptContext::create(engine)?;
    context.evaluate("define")?;
    let proxy = context.proxy("value", &getter())?;

    match proxy.call("getValue", vec![]).unwrap_err() {
        BridgeError::ScriptRuntime(exception) => {
            assert_eq!(exception.message(), "Error: no value");
            assert_eq!(exception.frames()[0], CallFrame::script("getValue", "value.js", 3));
            assert_eq!(exception.frames()[1].function, "RemoteProxy::call");
            assert!(exception.frames()[1].is_boundary());
        }
        other => panic!("unexpected {other:?}"),
    }
    context.close();
    Ok(())
}

#[test]
fn test_arity() -> Result<()> {
    let engine = Arc::new(ScriptedEngine::new());
    engine.register("d(2)", |js, _| js.call("calc", "d", vec![ScriptValue::Int(2)]));
    engine.register("define", |js, _| {
        let f = ScriptFunction::new("getValue", "value.js", 1, |_, _| Ok(1.into()));
        js.define_object("value", vec![("getValue", Member::Function(f))])?;
        Ok(ScriptValue::Undefined)
    });
    let context = ScriptContext::create(engine)?;
    let (descriptor, service) = divider();
    context.bind("calc", &descriptor, Arc::new(service))?;
    context.evaluate("define")?;

    let err = context.evaluate("d(2)").unwrap_err();
    assert_eq!(
        err.to_string(),
        "Wrong number of arguments calling Divider.d: expected 2, got 1"
    );

    let proxy = context.proxy("value", &getter())?;
    let err = proxy.call("getValue", vec![HostValue::Int(1)]).unwrap_err();
    assert!(matches!(err, BridgeError::Arity { actual: 1, .. }), "{err:?}");
    context.close();
    Ok(())
}

#[test]
fn test_non_bmp_strings_round_trip() -> Result<()> {
    let engine = Arc::new(ScriptedEngine::new());
    let text = "G clef 𝄞, grin 😀, ü, 中文";
    engine.register("echo", move |js, _| js.call("echo", "echo", vec![text.into()]));
    engine.register("define", |js, _| {
        let f = ScriptFunction::new("echo", "echo.js", 1, |_, args| {
            Ok(args.into_iter().next().unwrap_or(ScriptValue::Undefined))
        });
        js.define_object("scriptEcho", vec![("echo", Member::Function(f))])?;
        Ok(ScriptValue::Undefined)
    });
    let context = ScriptContext::create(engine)?;
    let descriptor = ServiceDescriptor::new("Echo").method(
        MethodDescriptor::new("echo")
            .param(DeclaredType::String)
            .returns(DeclaredType::String),
    );
    let service = FnService::new().method("echo", |mut args| Ok(args.remove(0)));
    context.bind("echo", &descriptor, Arc::new(service))?;
    context.evaluate("define")?;

    assert_eq!(context.evaluate("echo")?, HostValue::from(text));
    let proxy = context.proxy("scriptEcho", &descriptor)?;
    assert_eq!(proxy.call("echo", vec![text.into()])?, HostValue::from(text));
    context.close();
    Ok(())
}

#[test]
fn test_host_method_reenters_its_context() -> Result<()> {
    let engine = Arc::new(ScriptedEngine::new());
    engine.register("run", |js, _| js.call("host", "reenter", vec![]));
    engine.register("closeInside", |js, _| js.call("host", "closeSelf", vec![]));
    let context = Arc::new(ScriptContext::create(engine.clone())?);
    let slot: Arc<OnceLock<Weak<ScriptContext>>> = Arc::new(OnceLock::new());
    let _ = slot.set(Arc::downgrade(&context));

    let descriptor = ServiceDescriptor::new("Host")
        .method(MethodDescriptor::new("reenter").returns(DeclaredType::Integer))
        .method(MethodDescriptor::new("closeSelf").returns(DeclaredType::Integer));
    let reenter_slot = slot.clone();
    let close_slot = slot;
    let service = FnService::new()
        .method("reenter", move |_| {
            let context = reenter_slot.get().and_then(Weak::upgrade).expect("context alive");
            context.evaluate("42").map_err(HostException::from_error)
        })
        .method("closeSelf", move |_| {
            let context = close_slot.get().and_then(Weak::upgrade).expect("context alive");
            context.close();
            assert!(context.is_closed());
            assert!(matches!(context.evaluate("1"), Err(BridgeError::NullContext)));
            Ok(HostValue::Int(1))
        });
    context.bind("host", &descriptor, Arc::new(service))?;

    assert_eq!(context.evaluate("run")?, HostValue::Int(42));
    assert_eq!(engine.live_contexts(), 1);

    assert_eq!(context.evaluate("closeInside")?, HostValue::Int(1));
    assert_eq!(engine.live_contexts(), 0);
    assert!(matches!(context.evaluate("run"), Err(BridgeError::NullContext)));
    Ok(())
}

#[test]
fn test_dropped_context_is_destroyed() -> Result<()> {
    let engine = Arc::new(ScriptedEngine::new());
    {
        let _context = ScriptContext::create(engine.clone())?;
        assert_eq!(engine.live_contexts(), 1);
    }
    assert_eq!(engine.live_contexts(), 0);
    Ok(())
}

#[test]
fn test_context_capacity() -> Result<()> {
    let engine = Arc::new(ScriptedEngine::with_capacity(1));
    let first = ScriptContext::create(engine.clone())?;
    assert!(matches!(
        ScriptContext::create(engine.clone()),
        Err(BridgeError::OutOfMemory(_))
    ));
    first.close();
    let second = ScriptContext::create(engine)?;
    second.close();
    Ok(())
}
