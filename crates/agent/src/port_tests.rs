// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use std::collections::HashMap;

#[test]
fn com_ports_compare_case_insensitively() {
    let a = PortKey::new("com3");
    let b = PortKey::new("COM3");
    assert_eq!(a, b);
    assert_eq!(a.canonical(), "COM3");
}

#[test]
fn com_display_preserves_os_casing() {
    let key = PortKey::new("com3");
    assert_eq!(key.display(), "com3");
    assert_eq!(key.to_string(), "com3");
}

#[test]
fn device_node_names_are_byte_exact() {
    let a = PortKey::new("/dev/ttyACM0");
    let b = PortKey::new("/dev/ttyacm0");
    assert_ne!(a, b);
    assert_eq!(a.canonical(), "/dev/ttyACM0");
}

#[test]
fn extended_com_syntax_normalizes() {
    let a = PortKey::new(r"\\.\com12");
    assert_eq!(a.canonical(), r"\\.\COM12");
}

#[test]
fn non_numeric_com_suffix_is_not_a_com_port() {
    let a = PortKey::new("comfort");
    assert_eq!(a.canonical(), "comfort");
}

#[test]
fn hash_lookup_uses_canonical_form() {
    let mut map = HashMap::new();
    map.insert(PortKey::new("COM4"), 1u32);
    assert_eq!(map.get(&PortKey::new("com4")), Some(&1));
}
