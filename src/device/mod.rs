//! Device records and connection-target resolution.
//!
//! A [`Device`] is what a client names in a request; a [`DeviceInfo`] is the
//! matching inventory record. [`resolve`] combines both with the vendor
//! registry into a [`ConnectionTarget`]: the ordered address list,
//! credentials, compiled vendor profile and session kind the transport
//! needs.

pub mod db;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::counters::Counters;
use crate::error::{DeviceError, Result};
use crate::vendor::{SessionKind, VendorProfile, VendorRegistry};

/// Connection parameters for a NETCONF channel.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionData {
    /// SSH subsystem name, preferred when set.
    pub subsystem: Option<String>,
    /// Command executed on the channel when no subsystem is available.
    pub exec_command: Option<String>,
}

/// A device as named in an RPC request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Device {
    pub hostname: String,

    /// Credentials; empty strings fall back to the inventory defaults.
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,

    /// Explicit address override, used verbatim when set.
    #[serde(default)]
    pub ip_address: Option<String>,

    /// Restrict address selection to management addresses.
    #[serde(default)]
    pub mgmt_ip: bool,

    /// Session kind override; must be supported by the vendor.
    #[serde(default)]
    pub session_type: Option<SessionKind>,

    /// NETCONF channel parameters.
    #[serde(default)]
    pub session_data: Option<SessionData>,

    /// Per-command prompt overrides, for commands that do not return to the
    /// normal prompt (e.g. `reboot`).
    #[serde(default)]
    pub command_prompts: HashMap<String, String>,

    /// Commands sent before the vendor `cli_setup` sequence.
    #[serde(default)]
    pub pre_setup_commands: Vec<String>,

    /// Clear-command override; an empty string disables the clear byte.
    #[serde(default)]
    pub clear_command: Option<String>,

    /// Try backup addresses in order on connection failure.
    #[serde(default)]
    pub failover_to_backup_ips: bool,
}

/// One address from the inventory, with its management annotation.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceIp {
    pub addr: String,
    #[serde(default)]
    pub mgmt: bool,
}

/// An inventory record for one device. Snapshots are immutable; refresh
/// replaces the whole map.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceInfo {
    pub hostname: String,

    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,

    /// Preferred addresses in order.
    #[serde(default)]
    pub pref_ips: Vec<DeviceIp>,

    /// Fallback address when no preferred address qualifies.
    pub ip: DeviceIp,

    /// Vendor profile name.
    #[serde(default)]
    pub vendor: Option<String>,

    #[serde(default)]
    pub alias: Option<String>,
}

/// Everything the session layer needs to reach one device.
#[derive(Debug, Clone)]
pub struct ConnectionTarget {
    pub hostname: String,

    /// Ordered addresses to try; a single entry unless failover is enabled.
    pub addrs: Vec<String>,
    pub port: u16,

    pub username: String,
    pub password: String,

    pub vendor: Arc<VendorProfile>,
    pub kind: SessionKind,
    pub session_data: SessionData,

    pub clear_command: Vec<u8>,
    pub command_prompts: HashMap<String, String>,
    pub pre_setup: Vec<String>,
}

/// Resolve a request + inventory record into a connection target.
pub fn resolve(
    device: &Device,
    info: &DeviceInfo,
    vendors: &VendorRegistry,
    counters: &Counters,
) -> Result<ConnectionTarget> {
    let vendor_name = info
        .vendor
        .as_deref()
        .ok_or_else(|| DeviceError::MissingVendor {
            hostname: device.hostname.clone(),
        })?;
    let vendor = vendors.get_or_default(vendor_name)?;

    let kind = vendor.select_session_kind(device.session_type);
    if device.session_type.is_some() && device.session_type != Some(kind) {
        counters.increment("device_vendor.unsupported_session");
    }
    counters.increment("device_vendor.all_sessions");

    let addrs = select_addresses(device, info, counters);

    let username = if device.username.is_empty() {
        info.username.clone()
    } else {
        device.username.clone()
    };
    let password = if device.username.is_empty() {
        info.password.clone()
    } else {
        device.password.clone()
    };

    let session_data = device.session_data.clone().unwrap_or_default();
    if kind == SessionKind::SshNetconf
        && session_data.subsystem.is_none()
        && session_data.exec_command.is_none()
    {
        return Err(DeviceError::MissingSessionData.into());
    }

    let clear_command = match &device.clear_command {
        Some(c) => c.as_bytes().to_vec(),
        None => vendor.clear_command.clone(),
    };

    Ok(ConnectionTarget {
        hostname: device.hostname.clone(),
        addrs,
        port: vendor.port,
        username,
        password,
        kind,
        session_data,
        clear_command,
        command_prompts: device.command_prompts.clone(),
        pre_setup: device.pre_setup_commands.clone(),
        vendor,
    })
}

/// Address-selection policy: explicit override, then preferred addresses
/// (management-only when requested), then the inventory fallback address.
fn select_addresses(device: &Device, info: &DeviceInfo, counters: &Counters) -> Vec<String> {
    if let Some(ip) = &device.ip_address {
        return vec![ip.clone()];
    }

    if device.mgmt_ip {
        counters.increment("device_info.mgmt_ip");
    }

    let mut addrs: Vec<String> = Vec::new();
    for ip in &info.pref_ips {
        if device.mgmt_ip && !ip.mgmt {
            continue;
        }
        if !addrs.contains(&ip.addr) {
            addrs.push(ip.addr.clone());
        }
    }

    if !addrs.contains(&info.ip.addr) {
        counters.increment("device_info.default_ip");
        addrs.push(info.ip.addr.clone());
    }

    if !device.failover_to_backup_ips {
        addrs.truncate(1);
    }
    addrs
}
