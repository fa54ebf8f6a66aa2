// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire types for the OpenStack services the migrator touches.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Keystone

#[derive(Serialize)]
pub(crate) struct AuthRequest {
    pub auth: Auth,
}

#[derive(Serialize)]
pub(crate) struct Auth {
    pub identity: Identity,
    pub scope: Scope,
}

#[derive(Serialize)]
pub(crate) struct Identity {
    pub methods: Vec<String>,
    pub password: PasswordMethod,
}

#[derive(Serialize)]
pub(crate) struct PasswordMethod {
    pub user: User,
}

#[derive(Serialize)]
pub(crate) struct User {
    pub name: String,
    pub domain: Domain,
    pub password: String,
}

#[derive(Serialize)]
pub(crate) struct Domain {
    pub name: String,
}

#[derive(Serialize)]
pub(crate) struct Scope {
    pub project: Project,
}

#[derive(Serialize)]
pub(crate) struct Project {
    pub name: String,
    pub domain: Domain,
}

#[derive(Deserialize)]
pub(crate) struct TokenResponse {
    pub token: Token,
}

#[derive(Deserialize)]
pub(crate) struct Token {
    #[serde(default)]
    pub catalog: Vec<CatalogEntry>,
}

#[derive(Deserialize)]
pub(crate) struct CatalogEntry {
    #[serde(rename = "type")]
    pub service_type: String,
    pub endpoints: Vec<CatalogEndpoint>,
}

#[derive(Deserialize)]
pub(crate) struct CatalogEndpoint {
    pub interface: String,
    #[serde(default)]
    pub region: Option<String>,
    pub url: String,
}

// Cinder

#[derive(Debug, Clone, Deserialize)]
pub struct Volume {
    pub id: Uuid,
    #[serde(default)]
    pub name: Option<String>,
    pub status: String,
    pub size: i64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Deserialize)]
pub(crate) struct VolumeResponse {
    pub volume: Volume,
}

#[derive(Deserialize)]
pub(crate) struct VolumesResponse {
    pub volumes: Vec<Volume>,
}

#[derive(Serialize)]
pub(crate) struct VolumeCreateRequest {
    pub volume: VolumeCreate,
}

#[derive(Serialize)]
pub(crate) struct VolumeCreate {
    pub name: String,
    pub size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Serialize)]
pub(crate) struct VolumeUpdateRequest {
    pub volume: VolumeUpdate,
}

#[derive(Serialize)]
pub(crate) struct VolumeUpdate {
    pub metadata: BTreeMap<String, String>,
}

// Nova

#[derive(Serialize)]
pub(crate) struct VolumeAttachRequest {
    #[serde(rename = "volumeAttachment")]
    pub volume_attachment: VolumeAttachment,
}

#[derive(Serialize)]
pub(crate) struct VolumeAttachment {
    #[serde(rename = "volumeId")]
    pub volume_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Flavor {
    pub id: String,
    pub name: String,
}

#[derive(Deserialize)]
pub(crate) struct FlavorResponse {
    pub flavor: Flavor,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Server {
    pub id: Uuid,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct ServerResponse {
    pub server: Server,
}

#[derive(Serialize)]
pub(crate) struct ServerCreateRequest {
    pub server: ServerCreate,
}

#[derive(Serialize)]
pub(crate) struct ServerCreate {
    pub name: String,
    #[serde(rename = "flavorRef")]
    pub flavor_ref: String,
    pub networks: Vec<ServerNetwork>,
    pub block_device_mapping_v2: Vec<BlockDeviceMapping>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
}

#[derive(Serialize)]
pub(crate) struct ServerNetwork {
    pub port: Uuid,
}

#[derive(Serialize)]
pub struct BlockDeviceMapping {
    pub boot_index: i32,
    pub uuid: Uuid,
    pub source_type: String,
    pub destination_type: String,
}

// Neutron

#[derive(Debug, Clone, Deserialize)]
pub struct Port {
    pub id: Uuid,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct PortsResponse {
    pub ports: Vec<Port>,
}

#[derive(Deserialize)]
pub(crate) struct PortResponse {
    pub port: Port,
}

#[derive(Serialize)]
pub(crate) struct PortCreateRequest {
    pub port: PortCreate,
}

#[derive(Serialize)]
pub(crate) struct PortCreate {
    pub network_id: Uuid,
    pub name: String,
    pub description: String,
    pub mac_address: String,
    pub fixed_ips: Vec<FixedIp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_groups: Option<Vec<String>>,
}

#[derive(Serialize)]
pub(crate) struct FixedIp {
    pub subnet_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

// Metadata service

#[derive(Deserialize)]
pub(crate) struct InstanceMetadata {
    pub uuid: String,
}
