// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn defaults() {
    let config = AgentConfig::parse_from(["replx-agent"]);
    assert_eq!(config.agent_port, 8765);
    assert_eq!(config.baud, 115_200);
    assert_eq!(config.log_level, "info");
}

#[test]
fn flags_override_defaults() {
    let config = AgentConfig::parse_from(["replx-agent", "--agent-port", "9100", "--baud", "921600"]);
    assert_eq!(config.agent_port, 9100);
    assert_eq!(config.baud, 921_600);
}
