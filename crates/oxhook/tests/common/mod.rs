// Common test utilities for integration tests
//
// This module provides the `TestObject` fixture hierarchy: a root class with
// native method implementations and a subclass that only inherits them.

#![allow(dead_code)]

use oxhook::runtime::dispatch::send_message;
use oxhook::runtime::{BlockPtr, NativeImp, ObjectPtr, SelectorHandle};
use oxhook::{Block, Class, Encode, Invocation, Method, Object, Selector};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

static FIXTURE_ID: AtomicUsize = AtomicUsize::new(0);

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

// SAFETY: four doubles, `repr(C)`.
unsafe impl Encode for Rect {
    const ENCODING: &'static str = "{Rect=dddd}";
}

/// Selectors implemented by `TestObject`.
pub struct Selectors {
    /// `q@:qq`
    pub sum: Selector,
    /// `v@:`
    pub ping: Selector,
    /// `{Rect=dddd}@:d`
    pub square: Selector,
    /// `v@:@?<v@:q>` calls the block with `RUN_BLOCK_VALUE`
    pub run_block: Selector,
    /// `q@:`, reads the last value stored by `store:`
    pub value: Selector,
    /// `v@:q`
    pub store: Selector,
    /// `v@:`
    pub dealloc: Selector,
    /// class method `q#:`
    pub version: Selector,
}

pub fn selectors() -> Selectors {
    Selectors {
        sum: sel("sumWith:and:"),
        ping: sel("ping"),
        square: sel("squareOfSide:"),
        run_block: sel("runBlock:"),
        value: sel("value"),
        store: sel("store:"),
        dealloc: Selector::dealloc(),
        version: sel("version"),
    }
}

pub fn sel(name: &str) -> Selector {
    Selector::new(name).expect("Failed to create test selector")
}

/// A `TestObject` class and its `TestSubObject` subclass, uniquely named.
pub struct Fixture {
    pub class: Class,
    pub subclass: Class,
    /// Number of times the native `dealloc` ran for instances of `class`.
    pub deallocs: Arc<AtomicUsize>,
}

impl Fixture {
    pub fn new(tag: &str) -> Self {
        let id = FIXTURE_ID.fetch_add(1, Ordering::SeqCst);
        let class = Class::new_root(&format!("TestObject_{tag}_{id}"))
            .expect("Failed to create test class");
        let subclass = Class::new(&format!("TestSubObject_{tag}_{id}"), &class)
            .expect("Failed to create test subclass");
        let s = selectors();

        add(&class, s.sum, sum_impl as NativeImp, "q@:qq");
        add(&class, s.ping, noop_impl as NativeImp, "v@:");
        add(&class, s.square, square_impl as NativeImp, "{Rect=dddd}@:d");
        add(&class, s.run_block, run_block_impl as NativeImp, "v@:@?<v@:q>");
        add(&class, s.value, value_impl as NativeImp, "q@:");
        add(&class, s.store, store_impl as NativeImp, "v@:q");

        let deallocs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&deallocs);
        add(
            &class,
            s.dealloc,
            Block::opaque(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            "v@:",
        );

        let metaclass = class.metaclass().expect("class has a metaclass");
        add(&metaclass, s.version, version_impl as NativeImp, "q#:");

        Fixture {
            class,
            subclass,
            deallocs,
        }
    }

    pub fn object(&self) -> Object {
        Object::new(&self.class).expect("Failed to create test object")
    }

    pub fn sub_object(&self) -> Object {
        Object::new(&self.subclass).expect("Failed to create test object")
    }
}

fn add(class: &Class, selector: Selector, imp: impl Into<oxhook::Imp>, types: &str) {
    class
        .add_method(Method::new(selector, imp, types))
        .expect("Failed to add test method");
}

pub unsafe extern "C" fn sum_impl(
    _self: ObjectPtr,
    _cmd: SelectorHandle,
    args: *const *mut u8,
    ret: *mut u8,
) {
    unsafe {
        let a = (*args).cast::<i64>().read_unaligned();
        let b = (*args.add(1)).cast::<i64>().read_unaligned();
        if !ret.is_null() {
            ret.cast::<i64>().write_unaligned(a + b);
        }
    }
}

pub unsafe extern "C" fn noop_impl(
    _self: ObjectPtr,
    _cmd: SelectorHandle,
    _args: *const *mut u8,
    _ret: *mut u8,
) {
}

pub unsafe extern "C" fn square_impl(
    _self: ObjectPtr,
    _cmd: SelectorHandle,
    args: *const *mut u8,
    ret: *mut u8,
) {
    unsafe {
        let side = (*args).cast::<f64>().read_unaligned();
        if !ret.is_null() {
            ret.cast::<Rect>().write_unaligned(Rect {
                x: 0.0,
                y: 0.0,
                width: side,
                height: side,
            });
        }
    }
}

pub unsafe extern "C" fn run_block_impl(
    this: ObjectPtr,
    cmd: SelectorHandle,
    args: *const *mut u8,
    _ret: *mut u8,
) {
    unsafe {
        let block_ptr = (*args).cast::<BlockPtr>().read_unaligned();
        let (Some(block), Some(receiver)) = (block_ptr.to_block(), Object::from_ptr(this)) else {
            return;
        };
        let Ok(mut invocation) = Invocation::for_block(&block) else {
            return;
        };
        let filled = invocation
            .set_object_argument(0, Some(&receiver))
            .and_then(|()| invocation.set_argument(1, cmd))
            .and_then(|()| invocation.set_argument(2, RUN_BLOCK_VALUE));
        if filled.is_ok() {
            let _ = invocation.invoke();
        }
    }
}

/// Value `runBlock:` passes to its block.
pub const RUN_BLOCK_VALUE: i64 = 42;

pub unsafe extern "C" fn value_impl(
    this: ObjectPtr,
    _cmd: SelectorHandle,
    _args: *const *mut u8,
    ret: *mut u8,
) {
    unsafe {
        let Some(receiver) = Object::from_ptr(this) else {
            return;
        };
        let stored = receiver
            .associated::<Mutex<i64>>(STORE_KEY)
            .map_or(0, |value| *value.lock().unwrap());
        if !ret.is_null() {
            ret.cast::<i64>().write_unaligned(stored);
        }
    }
}

pub unsafe extern "C" fn store_impl(
    this: ObjectPtr,
    _cmd: SelectorHandle,
    args: *const *mut u8,
    _ret: *mut u8,
) {
    unsafe {
        let Some(receiver) = Object::from_ptr(this) else {
            return;
        };
        let value = (*args).cast::<i64>().read_unaligned();
        receiver.set_associated(STORE_KEY, Arc::new(Mutex::new(value)));
    }
}

pub unsafe extern "C" fn version_impl(
    _self: ObjectPtr,
    _cmd: SelectorHandle,
    _args: *const *mut u8,
    ret: *mut u8,
) {
    if !ret.is_null() {
        unsafe { ret.cast::<i64>().write_unaligned(1) };
    }
}

/// Association key used by `store:` and `value`.
pub const STORE_KEY: usize = 0x5354_4f52;

/// Sends `sumWith:and:`.
pub fn sum(object: &Object, a: i64, b: i64) -> i64 {
    send_message(object, &selectors().sum, &[&a, &b]).expect("sumWith:and:")
}

/// Records strings in call order.
#[derive(Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.entries.lock().unwrap())
    }

    /// A before/after closure (`v`) that records `entry`.
    pub fn recorder(&self, entry: &str) -> Block {
        let log = self.clone();
        let entry = entry.to_string();
        Block::new("v", move |_| log.push(entry.clone())).expect("recorder block")
    }
}

/// An instead closure for `sumWith:and:` that returns the original's
/// result unchanged.
pub fn sum_passthrough() -> Block {
    Block::new("q@?<q@:qq>@:qq", |call| {
        let mut original = call.forward(0).expect("forward");
        original.invoke().expect("original");
        call.set_return_from(&original).expect("return");
    })
    .expect("passthrough block")
}

/// An instead closure for a `v@:` method that records `entry` before and
/// after calling the original.
pub fn instead_recorder(log: &CallLog, entry: &str) -> Block {
    let log = log.clone();
    let entry = entry.to_string();
    Block::new("v@?<v@:>@:", move |call| {
        log.push(entry.clone());
        call.forward(0).expect("forward").invoke().expect("original");
        log.push(entry.clone());
    })
    .expect("instead recorder block")
}
