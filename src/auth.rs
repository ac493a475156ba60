/*
 * SPDX-FileCopyrightText: Copyright (c) 2023-2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use netaddr2::{Contains, NetAddr};
use std::net::IpAddr;

/// Checks a peer against the allowed networks, only loopback peers are allowed when none are configured.
pub fn authorize(networks: &[NetAddr], peer: &IpAddr) -> bool {
    let allowed = if networks.is_empty() {
        peer.is_loopback() || peer.to_canonical().is_loopback()
    } else {
        networks.iter().any(|n| n.contains(peer) || n.contains(&peer.to_canonical()))
    };

    if allowed {
        tracing::debug!(%peer, "peer authorized");
    } else {
        tracing::warn!(%peer, "request refused due to network policy");
    }
    allowed
}
