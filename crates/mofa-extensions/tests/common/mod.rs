//! Common test utilities shared across the `mofa-extensions` integration tests.
//!
//! This module is **not** a standalone test binary. It is declared with
//! `mod common;` inside each integration test file that needs it.

#![allow(dead_code)]

use mofa_extensions::{
    EngineConfig, EngineFactory, ExtensionEngine, ExtensionPackage, FieldKind, FieldValue,
    IntentHandle, KeyBuilderHandle, KeyHandle, ReadCallback, RowWriter, SafeState, StateError,
    StateResult, ValueHandle,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use tempfile::TempDir;
use url::Url;

pub const PACKAGE: &str = "test.pkg";
pub const STORAGE: &str = "storage";
pub const ENTITY: &str = "entity";

/// Every extension exported by [`guest_wat`]
pub const EXTENSIONS: &[&str] = &[
    "greet",
    "copy_name",
    "sum_amounts",
    "allocate",
    "bump",
    "check_counter",
    "panic",
    "trap",
    "spin",
    "bad_read",
    "bad_writer",
    "missing_record",
    "check_exists",
    "find_bob",
    "write_kinds",
    "copy_kinds",
    "copy_keys",
    "copy_items",
    "bad_index",
    "append_item",
    "reset_items",
];

/// Bytes requested by one call of the `allocate` extension
pub const ALLOCATE_CHUNK: u64 = 262_144;

/// Bytes of one element of the `append_item` array
pub const ITEM_SIZE: u64 = 4096;

/// Bytes allocated by one call of the `reset_items` extension
pub const RESET_ALLOCATION: u64 = 96;

/// A guest implementing ABI 0.1 with a bump allocator.
///
/// Memory layout: heap top at 0 (starting at 1024), heap counters at 8/16/24
/// (in use, mallocs, frees), a scratch sum at 32, the `on_read_value` mode at
/// 40 and its key builder at 48, the growable array (pointer, length,
/// capacity) at 208 and constant strings from 64.
pub fn guest_wat() -> String {
    r#"
(module
  (import "env" "host_panic" (func $host_panic (param i32 i32)))
  (import "env" "host_get_key" (func $host_get_key (param i32 i32 i32 i32) (result i64)))
  (import "env" "host_must_exist" (func $host_must_exist (param i64) (result i64)))
  (import "env" "host_can_exist" (func $host_can_exist (param i64) (result i32 i64)))
  (import "env" "host_read_values" (func $host_read_values (param i64)))
  (import "env" "host_new_value" (func $host_new_value (param i64) (result i64)))
  (import "env" "host_update_value" (func $host_update_value (param i64 i64) (result i64)))

  (import "env" "host_row_writer_put_string"
    (func $put_string (param i64 i32 i32 i32 i32 i32)))
  (import "env" "host_row_writer_put_bytes"
    (func $put_bytes (param i64 i32 i32 i32 i32 i32)))
  (import "env" "host_row_writer_put_int32" (func $put_int32 (param i64 i32 i32 i32 i32)))
  (import "env" "host_row_writer_put_int64" (func $put_int64 (param i64 i32 i32 i32 i64)))
  (import "env" "host_row_writer_put_float32" (func $put_float32 (param i64 i32 i32 i32 f32)))
  (import "env" "host_row_writer_put_float64" (func $put_float64 (param i64 i32 i32 i32 f64)))
  (import "env" "host_row_writer_put_bool" (func $put_bool (param i64 i32 i32 i32 i32)))
  (import "env" "host_row_writer_put_qname"
    (func $put_qname (param i64 i32 i32 i32 i32 i32 i32 i32)))

  (import "env" "host_value_as_string" (func $value_as_string (param i64 i32 i32) (result i64)))
  (import "env" "host_value_as_bytes" (func $value_as_bytes (param i64 i32 i32) (result i64)))
  (import "env" "host_value_as_int32" (func $value_as_int32 (param i64 i32 i32) (result i32)))
  (import "env" "host_value_as_int64" (func $value_as_int64 (param i64 i32 i32) (result i64)))
  (import "env" "host_value_as_float32" (func $value_as_float32 (param i64 i32 i32) (result f32)))
  (import "env" "host_value_as_float64" (func $value_as_float64 (param i64 i32 i32) (result f64)))
  (import "env" "host_value_as_bool" (func $value_as_bool (param i64 i32 i32) (result i32)))
  (import "env" "host_value_as_qname_pkg"
    (func $value_as_qname_pkg (param i64 i32 i32) (result i64)))
  (import "env" "host_value_as_qname_entity"
    (func $value_as_qname_entity (param i64 i32 i32) (result i64)))
  (import "env" "host_value_as_value" (func $value_as_value (param i64 i32 i32) (result i64)))

  (import "env" "host_key_as_string" (func $key_as_string (param i64 i32 i32) (result i64)))
  (import "env" "host_key_as_bytes" (func $key_as_bytes (param i64 i32 i32) (result i64)))
  (import "env" "host_key_as_int32" (func $key_as_int32 (param i64 i32 i32) (result i32)))
  (import "env" "host_key_as_int64" (func $key_as_int64 (param i64 i32 i32) (result i64)))
  (import "env" "host_key_as_float32" (func $key_as_float32 (param i64 i32 i32) (result f32)))
  (import "env" "host_key_as_float64" (func $key_as_float64 (param i64 i32 i32) (result f64)))
  (import "env" "host_key_as_bool" (func $key_as_bool (param i64 i32 i32) (result i32)))
  (import "env" "host_key_as_qname_pkg" (func $key_as_qname_pkg (param i64 i32 i32) (result i64)))
  (import "env" "host_key_as_qname_entity"
    (func $key_as_qname_entity (param i64 i32 i32) (result i64)))

  (import "env" "host_value_get_as_string" (func $item_as_string (param i64 i32) (result i64)))
  (import "env" "host_value_get_as_bytes" (func $item_as_bytes (param i64 i32) (result i64)))
  (import "env" "host_value_get_as_int32" (func $item_as_int32 (param i64 i32) (result i32)))
  (import "env" "host_value_get_as_int64" (func $item_as_int64 (param i64 i32) (result i64)))
  (import "env" "host_value_get_as_float32" (func $item_as_float32 (param i64 i32) (result f32)))
  (import "env" "host_value_get_as_float64" (func $item_as_float64 (param i64 i32) (result f64)))
  (import "env" "host_value_get_as_bool" (func $item_as_bool (param i64 i32) (result i32)))
  (import "env" "host_value_get_as_qname_pkg" (func $item_as_qname_pkg (param i64 i32) (result i64)))
  (import "env" "host_value_get_as_qname_entity"
    (func $item_as_qname_entity (param i64 i32) (result i64)))
  (import "env" "host_value_get_as_value" (func $item_as_value (param i64 i32) (result i64)))
  (import "env" "host_value_len" (func $value_len (param i64) (result i32)))

  (memory (export "memory") 1)
  (global $counter (export "counter") (mut i32) (i32.const 0))

  (data (i32.const 0) "\00\04\00\00")
  (data (i32.const 64) "storage")
  (data (i32.const 80) "entity")
  (data (i32.const 96) "greeting")
  (data (i32.const 112) "hello")
  (data (i32.const 128) "name")
  (data (i32.const 144) "amount")
  (data (i32.const 160) "boom")
  (data (i32.const 176) "total")
  (data (i32.const 192) "missing")
  (data (i32.const 256) "found")
  (data (i32.const 272) "visits")
  (data (i32.const 288) "bob")
  (data (i32.const 304) "blob")
  (data (i32.const 320) "i32")
  (data (i32.const 336) "f32")
  (data (i32.const 352) "f64")
  (data (i32.const 368) "flag")
  (data (i32.const 384) "kind")
  (data (i32.const 400) "app")
  (data (i32.const 416) "Order")
  (data (i32.const 432) "\01\02\03")
  (data (i32.const 448) "child")
  (data (i32.const 464) "len")
  (data (i32.const 480) "grand_len")
  (data (i32.const 496) "a_str")
  (data (i32.const 512) "b_bytes")
  (data (i32.const 528) "c_i32")
  (data (i32.const 544) "d_i64")
  (data (i32.const 560) "e_f32")
  (data (i32.const 576) "f_f64")
  (data (i32.const 592) "g_bool")
  (data (i32.const 608) "h_qname")

  (func $malloc (export "malloc") (param $size i32) (result i32)
    (local $ptr i32) (local $top i32) (local $have i32)
    (local.set $ptr (i32.load (i32.const 0)))
    (local.set $top
      (i32.and (i32.add (i32.add (local.get $ptr) (local.get $size)) (i32.const 7))
               (i32.const -8)))
    (local.set $have (i32.mul (memory.size) (i32.const 65536)))
    (if (i32.gt_u (local.get $top) (local.get $have))
      (then
        (if (i32.eq
              (memory.grow
                (i32.shr_u
                  (i32.add (i32.sub (local.get $top) (local.get $have)) (i32.const 65535))
                  (i32.const 16)))
              (i32.const -1))
          (then unreachable))))
    (i32.store (i32.const 0) (local.get $top))
    (i64.store (i32.const 8)
      (i64.add (i64.load (i32.const 8)) (i64.extend_i32_u (local.get $size))))
    (i64.store (i32.const 16) (i64.add (i64.load (i32.const 16)) (i64.const 1)))
    (local.get $ptr))

  (func (export "free") (param i32)
    (i64.store (i32.const 24) (i64.add (i64.load (i32.const 24)) (i64.const 1))))

  (func (export "abi_version_0_1"))

  (func (export "heap_in_use") (result i64) (i64.load (i32.const 8)))
  (func (export "heap_sys") (result i64)
    (i64.mul (i64.extend_i32_u (memory.size)) (i64.const 65536)))
  (func (export "heap_mallocs") (result i64) (i64.load (i32.const 16)))
  (func (export "heap_frees") (result i64) (i64.load (i32.const 24)))
  (func (export "heap_gc"))

  (func (export "on_read_value") (param $key i64) (param $value i64)
    (if (i32.load (i32.const 40))
      (then (call $copy_key_fields (local.get $key)))
      (else
        (i64.store (i32.const 32)
          (i64.add (i64.load (i32.const 32))
            (call $value_as_int64 (local.get $value) (i32.const 144) (i32.const 6)))))))

  (func $key (result i64)
    (call $host_get_key (i32.const 64) (i32.const 7) (i32.const 80) (i32.const 6)))

  (func $hi (param $word i64) (result i32)
    (i32.wrap_i64 (i64.shr_u (local.get $word) (i64.const 32))))
  (func $lo (param $word i64) (result i32)
    (i32.wrap_i64 (local.get $word)))

  ;; Writers taking packed (address << 32 | length) words staged by the host
  (func $put_packed_string (param $intent i64) (param $name i32) (param $len i32) (param $word i64)
    (call $put_string (local.get $intent) (i32.const 1) (local.get $name) (local.get $len)
      (call $hi (local.get $word)) (call $lo (local.get $word))))
  (func $put_packed_bytes (param $intent i64) (param $name i32) (param $len i32) (param $word i64)
    (call $put_bytes (local.get $intent) (i32.const 1) (local.get $name) (local.get $len)
      (call $hi (local.get $word)) (call $lo (local.get $word))))
  (func $put_packed_qname
    (param $intent i64) (param $name i32) (param $len i32) (param $pkg i64) (param $entity i64)
    (call $put_qname (local.get $intent) (i32.const 1) (local.get $name) (local.get $len)
      (call $hi (local.get $pkg)) (call $lo (local.get $pkg))
      (call $hi (local.get $entity)) (call $lo (local.get $entity))))

  (func (export "greet")
    (call $put_string (call $host_new_value (call $key)) (i32.const 1)
      (i32.const 96) (i32.const 8) (i32.const 112) (i32.const 5)))

  (func (export "copy_name")
    (local $key i64) (local $packed i64)
    (local.set $key (call $key))
    (local.set $packed
      (call $value_as_string (call $host_must_exist (local.get $key))
        (i32.const 128) (i32.const 4)))
    (call $put_string (call $host_new_value (local.get $key)) (i32.const 1)
      (i32.const 128) (i32.const 4)
      (i32.wrap_i64 (i64.shr_u (local.get $packed) (i64.const 32)))
      (i32.wrap_i64 (local.get $packed))))

  (func (export "sum_amounts")
    (local $key i64)
    (i64.store (i32.const 32) (i64.const 0))
    (local.set $key (call $key))
    (call $host_read_values (local.get $key))
    (call $put_int64 (call $host_new_value (local.get $key)) (i32.const 1)
      (i32.const 176) (i32.const 5) (i64.load (i32.const 32))))

  (func (export "allocate")
    (drop (call $malloc (i32.const 262144))))

  (func (export "bump")
    (global.set $counter (i32.add (global.get $counter) (i32.const 1))))

  (func (export "check_counter")
    (if (i32.ne (global.get $counter) (i32.const 0))
      (then unreachable)))

  (func (export "panic")
    (call $host_panic (i32.const 160) (i32.const 4)))

  (func (export "trap")
    unreachable)

  (func (export "spin")
    (loop $forever (br $forever)))

  (func (export "bad_read")
    (drop (call $host_get_key (i32.const 0x7FFFFFF0) (i32.const 100)
      (i32.const 80) (i32.const 6))))

  (func (export "bad_writer")
    (call $put_string (i64.const 1) (i32.const 7)
      (i32.const 96) (i32.const 8) (i32.const 112) (i32.const 5)))

  (func (export "missing_record")
    (drop (call $host_must_exist
      (call $host_get_key (i32.const 64) (i32.const 7) (i32.const 192) (i32.const 7)))))

  ;; Records whether a value exists; an existing one is updated with visits + 1
  (func (export "check_exists")
    (local $key i64) (local $found i32) (local $value i64) (local $intent i64)
    (local.set $key (call $key))
    (call $host_can_exist (local.get $key))
    (local.set $value)
    (local.set $found)
    (local.set $intent (call $host_new_value (local.get $key)))
    (call $put_bool (local.get $intent) (i32.const 1) (i32.const 256) (i32.const 5)
      (local.get $found))
    (if (local.get $found)
      (then
        (local.set $intent (call $host_update_value (local.get $key) (local.get $value)))
        (call $put_int32 (local.get $intent) (i32.const 1) (i32.const 272) (i32.const 6)
          (i32.add
            (call $value_as_int32 (local.get $value) (i32.const 272) (i32.const 6))
            (i32.const 1))))))

  ;; Narrows the key to name = "bob" and copies the matching amount
  (func (export "find_bob")
    (local $key i64) (local $value i64)
    (local.set $key (call $key))
    (call $put_string (local.get $key) (i32.const 0)
      (i32.const 128) (i32.const 4) (i32.const 288) (i32.const 3))
    (local.set $value (call $host_must_exist (local.get $key)))
    (call $put_int64 (call $host_new_value (local.get $key)) (i32.const 1)
      (i32.const 144) (i32.const 6)
      (call $value_as_int64 (local.get $value) (i32.const 144) (i32.const 6))))

  (func (export "write_kinds")
    (local $intent i64)
    (local.set $intent (call $host_new_value (call $key)))
    (call $put_bytes (local.get $intent) (i32.const 1) (i32.const 304) (i32.const 4)
      (i32.const 432) (i32.const 3))
    (call $put_int32 (local.get $intent) (i32.const 1) (i32.const 320) (i32.const 3)
      (i32.const -7))
    (call $put_float32 (local.get $intent) (i32.const 1) (i32.const 336) (i32.const 3)
      (f32.const 1.5))
    (call $put_float64 (local.get $intent) (i32.const 1) (i32.const 352) (i32.const 3)
      (f64.const 2.25))
    (call $put_bool (local.get $intent) (i32.const 1) (i32.const 368) (i32.const 4)
      (i32.const 1))
    (call $put_qname (local.get $intent) (i32.const 1) (i32.const 384) (i32.const 4)
      (i32.const 400) (i32.const 3) (i32.const 416) (i32.const 5)))

  ;; Copies every typed field of the stored value into a new intent
  (func (export "copy_kinds")
    (local $key i64) (local $value i64) (local $intent i64)
    (local.set $key (call $key))
    (local.set $value (call $host_must_exist (local.get $key)))
    (local.set $intent (call $host_new_value (local.get $key)))
    (call $put_packed_string (local.get $intent) (i32.const 128) (i32.const 4)
      (call $value_as_string (local.get $value) (i32.const 128) (i32.const 4)))
    (call $put_packed_bytes (local.get $intent) (i32.const 304) (i32.const 4)
      (call $value_as_bytes (local.get $value) (i32.const 304) (i32.const 4)))
    (call $put_int32 (local.get $intent) (i32.const 1) (i32.const 320) (i32.const 3)
      (call $value_as_int32 (local.get $value) (i32.const 320) (i32.const 3)))
    (call $put_int64 (local.get $intent) (i32.const 1) (i32.const 144) (i32.const 6)
      (call $value_as_int64 (local.get $value) (i32.const 144) (i32.const 6)))
    (call $put_float32 (local.get $intent) (i32.const 1) (i32.const 336) (i32.const 3)
      (call $value_as_float32 (local.get $value) (i32.const 336) (i32.const 3)))
    (call $put_float64 (local.get $intent) (i32.const 1) (i32.const 352) (i32.const 3)
      (call $value_as_float64 (local.get $value) (i32.const 352) (i32.const 3)))
    (call $put_bool (local.get $intent) (i32.const 1) (i32.const 368) (i32.const 4)
      (call $value_as_bool (local.get $value) (i32.const 368) (i32.const 4)))
    (call $put_packed_qname (local.get $intent) (i32.const 384) (i32.const 4)
      (call $value_as_qname_pkg (local.get $value) (i32.const 384) (i32.const 4))
      (call $value_as_qname_entity (local.get $value) (i32.const 384) (i32.const 4))))

  ;; Same copy, reading the key of every row produced by read_values
  (func (export "copy_keys")
    (i64.store (i32.const 48) (call $key))
    (i32.store (i32.const 40) (i32.const 1))
    (call $host_read_values (i64.load (i32.const 48)))
    (i32.store (i32.const 40) (i32.const 0)))

  (func $copy_key_fields (param $k i64)
    (local $intent i64)
    (local.set $intent (call $host_new_value (i64.load (i32.const 48))))
    (call $put_packed_string (local.get $intent) (i32.const 128) (i32.const 4)
      (call $key_as_string (local.get $k) (i32.const 128) (i32.const 4)))
    (call $put_packed_bytes (local.get $intent) (i32.const 304) (i32.const 4)
      (call $key_as_bytes (local.get $k) (i32.const 304) (i32.const 4)))
    (call $put_int32 (local.get $intent) (i32.const 1) (i32.const 320) (i32.const 3)
      (call $key_as_int32 (local.get $k) (i32.const 320) (i32.const 3)))
    (call $put_int64 (local.get $intent) (i32.const 1) (i32.const 144) (i32.const 6)
      (call $key_as_int64 (local.get $k) (i32.const 144) (i32.const 6)))
    (call $put_float32 (local.get $intent) (i32.const 1) (i32.const 336) (i32.const 3)
      (call $key_as_float32 (local.get $k) (i32.const 336) (i32.const 3)))
    (call $put_float64 (local.get $intent) (i32.const 1) (i32.const 352) (i32.const 3)
      (call $key_as_float64 (local.get $k) (i32.const 352) (i32.const 3)))
    (call $put_bool (local.get $intent) (i32.const 1) (i32.const 368) (i32.const 4)
      (call $key_as_bool (local.get $k) (i32.const 368) (i32.const 4)))
    (call $put_packed_qname (local.get $intent) (i32.const 384) (i32.const 4)
      (call $key_as_qname_pkg (local.get $k) (i32.const 384) (i32.const 4))
      (call $key_as_qname_entity (local.get $k) (i32.const 384) (i32.const 4))))

  ;; Reads the nested "child" value positionally: items 0..=7 are typed
  ;; fields, item 8 is a further nested value
  (func (export "copy_items")
    (local $key i64) (local $child i64) (local $intent i64)
    (local.set $key (call $key))
    (local.set $child
      (call $value_as_value (call $host_must_exist (local.get $key))
        (i32.const 448) (i32.const 5)))
    (local.set $intent (call $host_new_value (local.get $key)))
    (call $put_int32 (local.get $intent) (i32.const 1) (i32.const 464) (i32.const 3)
      (call $value_len (local.get $child)))
    (call $put_packed_string (local.get $intent) (i32.const 496) (i32.const 5)
      (call $item_as_string (local.get $child) (i32.const 0)))
    (call $put_packed_bytes (local.get $intent) (i32.const 512) (i32.const 7)
      (call $item_as_bytes (local.get $child) (i32.const 1)))
    (call $put_int32 (local.get $intent) (i32.const 1) (i32.const 528) (i32.const 5)
      (call $item_as_int32 (local.get $child) (i32.const 2)))
    (call $put_int64 (local.get $intent) (i32.const 1) (i32.const 544) (i32.const 5)
      (call $item_as_int64 (local.get $child) (i32.const 3)))
    (call $put_float32 (local.get $intent) (i32.const 1) (i32.const 560) (i32.const 5)
      (call $item_as_float32 (local.get $child) (i32.const 4)))
    (call $put_float64 (local.get $intent) (i32.const 1) (i32.const 576) (i32.const 5)
      (call $item_as_float64 (local.get $child) (i32.const 5)))
    (call $put_bool (local.get $intent) (i32.const 1) (i32.const 592) (i32.const 6)
      (call $item_as_bool (local.get $child) (i32.const 6)))
    (call $put_packed_qname (local.get $intent) (i32.const 608) (i32.const 7)
      (call $item_as_qname_pkg (local.get $child) (i32.const 7))
      (call $item_as_qname_entity (local.get $child) (i32.const 7)))
    (call $put_int32 (local.get $intent) (i32.const 1) (i32.const 480) (i32.const 9)
      (call $value_len (call $item_as_value (local.get $child) (i32.const 8)))))

  (func (export "bad_index")
    (drop (call $item_as_int32
      (call $value_as_value (call $host_must_exist (call $key)) (i32.const 448) (i32.const 5))
      (i32.const 99))))

  ;; Growable array of 4 KiB items; a full array doubles into a new block
  (func (export "append_item")
    (local $ptr i32) (local $len i32) (local $cap i32) (local $block i32)
    (local.set $ptr (i32.load (i32.const 208)))
    (local.set $len (i32.load (i32.const 212)))
    (local.set $cap (i32.load (i32.const 216)))
    (if (i32.eq (local.get $len) (local.get $cap))
      (then
        (local.set $cap
          (select (i32.shl (local.get $cap) (i32.const 1)) (i32.const 4) (local.get $cap)))
        (local.set $block (call $malloc (i32.mul (local.get $cap) (i32.const 4096))))
        (memory.copy (local.get $block) (local.get $ptr)
          (i32.mul (local.get $len) (i32.const 4096)))
        (local.set $ptr (local.get $block))
        (i32.store (i32.const 208) (local.get $ptr))
        (i32.store (i32.const 216) (local.get $cap))))
    (memory.fill (i32.add (local.get $ptr) (i32.mul (local.get $len) (i32.const 4096)))
      (i32.const 0xAB) (i32.const 4096))
    (i32.store (i32.const 212) (i32.add (local.get $len) (i32.const 1))))

  ;; Drops the array; the bump allocator keeps its blocks
  (func (export "reset_items")
    (i32.store (i32.const 208) (i32.const 0))
    (i32.store (i32.const 212) (i32.const 0))
    (i32.store (i32.const 216) (i32.const 0))
    (drop (call $malloc (i32.const 96))))

  (func (export "with_param") (param i32))
)
"#
    .to_string()
}

/// [`guest_wat`] whose exported `malloc` serves requests of up to `limit`
/// bytes and answers larger ones with the `fallback` instruction
pub fn guest_wat_with_capped_malloc(limit: u32, fallback: &str) -> String {
    let capped = format!(
        r#"(func (export "with_param") (param i32))
  (func (export "malloc") (param $size i32) (result i32)
    (if (result i32) (i32.le_u (local.get $size) (i32.const {}))
      (then (call $malloc (local.get $size)))
      (else {})))"#,
        limit, fallback
    );
    guest_wat()
        .replace(r#"(func $malloc (export "malloc")"#, "(func $malloc")
        .replace(r#"(func (export "with_param") (param i32))"#, &capped)
}

/// A guest keeping its allocator state in unexported globals
pub fn global_heap_wat() -> String {
    r#"
(module
  (memory (export "memory") 1)
  (global $top (mut i32) (i32.const 1024))
  (global $in_use (mut i64) (i64.const 0))
  (global $mallocs (mut i64) (i64.const 0))

  (func $malloc (export "malloc") (param $size i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $top))
    (global.set $top
      (i32.and (i32.add (i32.add (local.get $ptr) (local.get $size)) (i32.const 7))
               (i32.const -8)))
    (if (i32.gt_u (global.get $top) (i32.mul (memory.size) (i32.const 65536)))
      (then unreachable))
    (global.set $in_use (i64.add (global.get $in_use) (i64.extend_i32_u (local.get $size))))
    (global.set $mallocs (i64.add (global.get $mallocs) (i64.const 1)))
    (local.get $ptr))

  (func (export "free") (param i32))
  (func (export "abi_version_0_1"))
  (func (export "heap_in_use") (result i64) (global.get $in_use))
  (func (export "heap_sys") (result i64) (i64.const 65536))
  (func (export "heap_mallocs") (result i64) (global.get $mallocs))
  (func (export "heap_frees") (result i64) (i64.const 0))
  (func (export "heap_gc"))
  (func (export "on_read_value") (param i64 i64))

  (func (export "alloc")
    (drop (call $malloc (i32.const 4096))))

  (func (export "alloc_then_trap")
    (drop (call $malloc (i32.const 4096)))
    unreachable)
)
"#
    .to_string()
}

/// Write `wat` to `dir/<name>.wat` and return its `file://` URL
pub fn write_guest(dir: &Path, name: &str, wat: &str) -> Url {
    let path = dir.join(format!("{}.wat", name));
    std::fs::write(&path, wat).unwrap();
    Url::from_file_path(&path).unwrap()
}

/// Package with every extension of [`guest_wat`]
pub fn test_package(url: Url) -> ExtensionPackage {
    ExtensionPackage::new(PACKAGE, url).with_extensions(EXTENSIONS.iter().copied())
}

/// One engine with `wat` loaded as [`PACKAGE`]
pub async fn load_guest(
    wat: &str,
    extensions: &[&str],
    config: EngineConfig,
) -> (TempDir, ExtensionEngine) {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let url = write_guest(dir.path(), "guest", wat);
    let package = ExtensionPackage::new(PACKAGE, url).with_extensions(extensions.iter().copied());
    let factory = EngineFactory::new("test-app", config).unwrap();
    let mut engines = factory.new_engines(&[package], 1).await.unwrap();
    (dir, engines.remove(0))
}

/// One engine with the standard guest loaded as [`PACKAGE`]
pub async fn load_engine(config: EngineConfig) -> (TempDir, ExtensionEngine) {
    load_guest(&guest_wat(), EXTENSIONS, config).await
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

type Row = HashMap<String, FieldValue>;

#[derive(Default)]
struct Tables {
    next_handle: u64,
    records: HashMap<(String, String), Vec<Row>>,
    key_builders: HashMap<u64, (String, String, Row)>,
    keys: HashMap<u64, Row>,
    values: HashMap<u64, Row>,
    intents: HashMap<u64, (String, Row)>,
}

impl Tables {
    fn mint(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    /// Stored rows matching every field set on the key builder
    fn rows(&self, key: KeyBuilderHandle) -> StateResult<Vec<Row>> {
        let (storage, entity, fields) = self
            .key_builders
            .get(&key.0)
            .ok_or(StateError::InvalidHandle(key.0))?;
        let rows = self
            .records
            .get(&(storage.clone(), entity.clone()))
            .map(Vec::as_slice)
            .unwrap_or_default();
        Ok(rows
            .iter()
            .filter(|row| fields.iter().all(|(name, value)| row.get(name) == Some(value)))
            .cloned()
            .collect())
    }

    fn entity(&self, key: KeyBuilderHandle) -> StateResult<String> {
        self.key_builders
            .get(&key.0)
            .map(|(_, entity, _)| entity.clone())
            .ok_or(StateError::InvalidHandle(key.0))
    }
}

/// In-memory state adapter recording every intent
#[derive(Default)]
pub struct MapState {
    tables: Mutex<Tables>,
}

impl MapState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(self, storage: &str, entity: &str, fields: Vec<(&str, FieldValue)>) -> Self {
        let row = to_row(fields);
        self.tables
            .lock()
            .records
            .entry((storage.to_string(), entity.to_string()))
            .or_default()
            .push(row);
        self
    }

    /// Store `fields` as a nested value and return a field referencing it
    pub fn nested(&self, fields: Vec<(&str, FieldValue)>) -> FieldValue {
        let mut tables = self.tables.lock();
        let id = tables.mint();
        tables.values.insert(id, to_row(fields));
        FieldValue::Value(ValueHandle(id))
    }

    /// Fields written to intents, in creation order
    pub fn intents(&self) -> Vec<(String, Row)> {
        let tables = self.tables.lock();
        let mut ids: Vec<&u64> = tables.intents.keys().collect();
        ids.sort();
        ids.into_iter()
            .map(|id| tables.intents[id].clone())
            .collect()
    }
}

fn to_row(fields: Vec<(&str, FieldValue)>) -> Row {
    fields
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

fn field(row: Option<&Row>, handle: u64, name: &str) -> StateResult<FieldValue> {
    row.ok_or(StateError::InvalidHandle(handle))?
        .get(name)
        .cloned()
        .ok_or_else(|| StateError::NotFound(name.to_string()))
}

impl SafeState for MapState {
    fn key_builder(&self, storage: &str, entity: &str) -> StateResult<KeyBuilderHandle> {
        let mut tables = self.tables.lock();
        let id = tables.mint();
        tables
            .key_builders
            .insert(id, (storage.to_string(), entity.to_string(), Row::new()));
        Ok(KeyBuilderHandle(id))
    }

    fn must_exist(&self, key: KeyBuilderHandle) -> StateResult<ValueHandle> {
        self.can_exist(key)?.ok_or_else(|| {
            let entity = self.tables.lock().entity(key).unwrap_or_default();
            StateError::NotFound(entity)
        })
    }

    fn can_exist(&self, key: KeyBuilderHandle) -> StateResult<Option<ValueHandle>> {
        let mut tables = self.tables.lock();
        let Some(row) = tables.rows(key)?.into_iter().next() else {
            return Ok(None);
        };
        let id = tables.mint();
        tables.values.insert(id, row);
        Ok(Some(ValueHandle(id)))
    }

    fn read_values(
        &self,
        key: KeyBuilderHandle,
        callback: &mut ReadCallback<'_>,
    ) -> StateResult<()> {
        // Handles are minted up front; the callback re-enters the adapter
        let handles: Vec<(KeyHandle, ValueHandle)> = {
            let mut tables = self.tables.lock();
            let rows = tables.rows(key)?;
            rows.into_iter()
                .map(|row| {
                    let key_id = tables.mint();
                    tables.keys.insert(key_id, row.clone());
                    let value_id = tables.mint();
                    tables.values.insert(value_id, row);
                    (KeyHandle(key_id), ValueHandle(value_id))
                })
                .collect()
        };
        for (key, value) in handles {
            callback(key, value)?;
        }
        Ok(())
    }

    fn new_value(&self, key: KeyBuilderHandle) -> StateResult<IntentHandle> {
        let mut tables = self.tables.lock();
        let entity = tables.entity(key)?;
        let id = tables.mint();
        tables.intents.insert(id, (entity, Row::new()));
        Ok(IntentHandle(id))
    }

    fn update_value(
        &self,
        key: KeyBuilderHandle,
        existing: ValueHandle,
    ) -> StateResult<IntentHandle> {
        let mut tables = self.tables.lock();
        let entity = tables.entity(key)?;
        let row = tables
            .values
            .get(&existing.0)
            .cloned()
            .ok_or(StateError::InvalidHandle(existing.0))?;
        let id = tables.mint();
        tables.intents.insert(id, (entity, row));
        Ok(IntentHandle(id))
    }

    fn put_field(&self, writer: RowWriter, name: &str, value: FieldValue) -> StateResult<()> {
        let mut tables = self.tables.lock();
        let row = match writer {
            RowWriter::KeyBuilder(handle) => tables
                .key_builders
                .get_mut(&handle.0)
                .map(|(_, _, row)| row)
                .ok_or(StateError::InvalidHandle(handle.0))?,
            RowWriter::Intent(handle) => tables
                .intents
                .get_mut(&handle.0)
                .map(|(_, row)| row)
                .ok_or(StateError::InvalidHandle(handle.0))?,
        };
        row.insert(name.to_string(), value);
        Ok(())
    }

    fn key_field(&self, key: KeyHandle, name: &str, _kind: FieldKind) -> StateResult<FieldValue> {
        field(self.tables.lock().keys.get(&key.0), key.0, name)
    }

    fn value_field(
        &self,
        value: ValueHandle,
        name: &str,
        _kind: FieldKind,
    ) -> StateResult<FieldValue> {
        field(self.tables.lock().values.get(&value.0), value.0, name)
    }

    /// Fields of the value ordered by name
    fn value_item(
        &self,
        value: ValueHandle,
        index: u32,
        _kind: FieldKind,
    ) -> StateResult<FieldValue> {
        let tables = self.tables.lock();
        let row = tables
            .values
            .get(&value.0)
            .ok_or(StateError::InvalidHandle(value.0))?;
        let mut fields: Vec<(&String, &FieldValue)> = row.iter().collect();
        fields.sort_by(|a, b| a.0.cmp(b.0));
        fields
            .get(index as usize)
            .map(|(_, value)| (*value).clone())
            .ok_or(StateError::IndexOutOfRange {
                index,
                len: row.len() as u32,
            })
    }

    fn value_len(&self, value: ValueHandle) -> StateResult<u32> {
        let tables = self.tables.lock();
        tables
            .values
            .get(&value.0)
            .map(|row| row.len() as u32)
            .ok_or(StateError::InvalidHandle(value.0))
    }
}
