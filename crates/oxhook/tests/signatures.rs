//! Hook then cancel round trips across signature shapes.

mod common;

use common::{CallLog, Rect};
use oxhook::hook::{closure_signature, is_compatible};
use oxhook::runtime::dispatch::{Argument, send_message};
use oxhook::runtime::ObjectPtr;
use oxhook::{
    Block, CancelOutcome, Class, Encode, HookManager, Method, Mode, Object, Selector,
    SignatureDescriptor,
};
use std::ffi::{CStr, c_char};
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};

static CLASS_ID: AtomicUsize = AtomicUsize::new(0);

/// An instead closure for `method` that returns the original's result.
fn passthrough(method: &str) -> Block {
    let signature = SignatureDescriptor::parse(method).unwrap();
    let arguments: String = signature.arguments().iter().map(ToString::to_string).collect();
    let encoding = format!("{}@?<{method}>{arguments}", signature.return_type());
    Block::new(&encoding, |call| {
        let mut original = call.forward(0).unwrap();
        original.invoke().unwrap();
        call.set_return_from(&original).unwrap();
    })
    .unwrap()
}

/// Defines `method` with `imp`, then checks that a full set of hooks and
/// their cancellation leave the result of `args` unchanged.
fn round_trip<R>(types: &str, imp: Block, args: &[&dyn Argument])
where
    R: Encode + PartialEq + Debug,
{
    let id = CLASS_ID.fetch_add(1, Ordering::SeqCst);
    let class = Class::new_root(&format!("SignatureRoundTrip_{id}")).unwrap();
    let sel = Selector::new("call").unwrap();
    class.add_method(Method::new(sel, imp, types)).unwrap();
    let object = Object::new(&class).unwrap();

    let unhooked: R = send_message(&object, &sel, args).unwrap();

    let manager = HookManager::new();
    let log = CallLog::new();
    let tokens = [
        manager
            .hook_class(&class, &sel, Mode::Before, log.recorder("class before"))
            .unwrap(),
        manager
            .hook_class(&class, &sel, Mode::Instead, passthrough(types))
            .unwrap(),
        manager
            .hook_object(&object, &sel, Mode::After, log.recorder("object after"))
            .unwrap(),
        manager
            .hook_object(&object, &sel, Mode::Instead, passthrough(types))
            .unwrap(),
    ];
    let hooked: R = send_message(&object, &sel, args).unwrap();
    assert_eq!(hooked, unhooked, "{types} while hooked");
    assert_eq!(log.take(), ["class before", "object after"], "{types}");

    let outcomes: Vec<_> = tokens.iter().map(|t| t.cancel().unwrap()).collect();
    assert_eq!(
        outcomes,
        [
            CancelOutcome::NotRestored,
            CancelOutcome::Restored,
            CancelOutcome::NotRestored,
            CancelOutcome::Restored,
        ],
        "{types}"
    );
    let restored: R = send_message(&object, &sel, args).unwrap();
    assert_eq!(restored, unhooked, "{types} after cancel");
    assert!(log.take().is_empty());
}

#[test]
fn test_void_round_trip() {
    let counter = std::sync::Arc::new(AtomicUsize::new(0));
    let seen = std::sync::Arc::clone(&counter);
    round_trip::<()>(
        "v@:",
        Block::opaque(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }),
        &[],
    );
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[test]
fn test_primitive_round_trips() {
    round_trip::<f64>(
        "d@:d",
        Block::opaque(|call| {
            let x: f64 = call.argument(2).unwrap();
            call.set_return_value(x / 2.0).unwrap();
        }),
        &[&5.0f64],
    );
    round_trip::<bool>(
        "B@:B",
        Block::opaque(|call| {
            let x: bool = call.argument(2).unwrap();
            call.set_return_value(!x).unwrap();
        }),
        &[&true],
    );
    round_trip::<i8>(
        "c@:cs",
        Block::opaque(|call| {
            let a: i8 = call.argument(2).unwrap();
            let b: i16 = call.argument(3).unwrap();
            call.set_return_value(a.wrapping_add(b as i8)).unwrap();
        }),
        &[&3i8, &4i16],
    );
    round_trip::<u32>(
        "I@:fQ",
        Block::opaque(|call| {
            let a: f32 = call.argument(2).unwrap();
            let b: u64 = call.argument(3).unwrap();
            call.set_return_value(a as u32 + b as u32).unwrap();
        }),
        &[&1.5f32, &40u64],
    );
}

#[test]
fn test_pointer_round_trips() {
    round_trip::<usize>(
        "Q@:*",
        Block::opaque(|call| {
            let text: *const c_char = call.argument(2).unwrap();
            let length = unsafe { CStr::from_ptr(text) }.to_bytes().len();
            call.set_return_value(length as u64).unwrap();
        }),
        &[&c"hello".as_ptr()],
    );

    let other_class = Class::new_root("SignatureRoundTripArgument").unwrap();
    let other = Object::new(&other_class).unwrap();
    round_trip::<ObjectPtr>(
        "@@:@",
        Block::opaque(|call| {
            let other: ObjectPtr = call.argument(2).unwrap();
            call.set_return_value(other).unwrap();
        }),
        &[&other],
    );

    round_trip::<bool>(
        "B@::",
        Block::opaque(|call| {
            let selector = call.selector_argument(2).unwrap();
            call.set_return_value(selector.is_some_and(|s| s.name() == "ping")).unwrap();
        }),
        &[&Selector::new("ping").unwrap().as_handle()],
    );
}

#[test]
fn test_structure_round_trips() {
    let rect = Rect {
        x: 1.0,
        y: 2.0,
        width: 3.0,
        height: 4.0,
    };
    round_trip::<f64>(
        "d@:{Rect=dddd}",
        Block::opaque(|call| {
            let rect: Rect = call.argument(2).unwrap();
            call.set_return_value(rect.width * rect.height).unwrap();
        }),
        &[&rect],
    );
    round_trip::<Rect>(
        "{Rect=dddd}@:{Rect=dddd}d",
        Block::opaque(|call| {
            let mut rect: Rect = call.argument(2).unwrap();
            let scale: f64 = call.argument(3).unwrap();
            rect.width *= scale;
            rect.height *= scale;
            call.set_return_value(rect).unwrap();
        }),
        &[&rect, &2.0f64],
    );
}

#[test]
fn test_callable_argument_round_trip() {
    let callback = Block::new("q@:q", |call| {
        let x: i64 = call.argument(2).unwrap();
        call.set_return_value(x * 3).unwrap();
    })
    .unwrap();
    round_trip::<i64>(
        "q@:@?<q@:q>",
        Block::opaque(|call| {
            let block = call.block_argument(2).unwrap().unwrap();
            let mut invocation = oxhook::Invocation::for_block(&block).unwrap();
            invocation.set_argument(2, 7i64).unwrap();
            invocation.invoke().unwrap();
            let value: i64 = invocation.return_value().unwrap();
            call.set_return_value(value).unwrap();
        }),
        &[&callback],
    );
}

#[test]
fn test_public_signature_helpers() {
    let method = SignatureDescriptor::parse_method("q@:qq").unwrap();
    let closure = Block::new("q@?<q@:qq>@:qq", |_| {}).unwrap();
    let signature = closure_signature(&closure).unwrap();
    assert!(is_compatible(&method, Mode::Instead, &signature));
    assert!(!is_compatible(&method, Mode::Before, &signature));
    assert!(closure_signature(&Block::opaque(|_| {})).is_err());
}
