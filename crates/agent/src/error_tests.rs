// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn wire_form_has_kind_prefix() {
    let err = ReplError::busy("Connection COM3 is busy");
    assert_eq!(err.to_wire(), "Busy: Connection COM3 is busy");
    assert_eq!(err.to_string(), err.to_wire());
}

#[test]
fn device_error_carries_traceback_verbatim() {
    let tb = "Traceback (most recent call last):\r\n  File \"<stdin>\", line 1\r\nNameError: name 'x' isn't defined\r\n";
    let err = ReplError::device(tb);
    assert_eq!(err.kind, ErrorKind::DeviceError);
    assert!(err.to_wire().contains("NameError"));
}

#[test]
fn only_disconnected_is_connection_fatal() {
    assert!(ErrorKind::Disconnected.connection_fatal());
    for kind in [
        ErrorKind::EnterRawFailed,
        ErrorKind::RawPasteError,
        ErrorKind::DeviceError,
        ErrorKind::Timeout,
        ErrorKind::Busy,
        ErrorKind::Interrupted,
        ErrorKind::ValidationError,
        ErrorKind::NotConnected,
        ErrorKind::ProtocolError,
    ] {
        assert!(!kind.connection_fatal(), "{kind} should not tear down the connection");
    }
}

#[test]
fn not_connected_mentions_port() {
    let err = ReplError::not_connected("COM7");
    assert_eq!(err.to_wire(), "NotConnected: Not connected: COM7");
}
