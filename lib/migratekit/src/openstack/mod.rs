// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Clients for the OpenStack services the destination side needs:
//! keystone (auth + catalog), cinder (volumes), nova (attachments,
//! flavors, servers) and neutron (ports), plus the instance metadata
//! service that identifies the migrator's own instance.
//!
//! Credentials come from the usual `OS_*` environment, the same contract
//! every OpenStack client honors.

mod types;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use slog::{info, Logger};
use thiserror::Error;
use uuid::Uuid;

pub use types::{
    BlockDeviceMapping, Flavor, Port, Server, Volume,
};
use types::*;

const METADATA_URL: &str =
    "http://169.254.169.254/openstack/latest/meta_data.json";

const STATUS_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum OpenstackError {
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),

    #[error("no {service} endpoint in the service catalog")]
    NoEndpoint { service: &'static str },

    #[error("keystone did not return a token")]
    NoToken,

    #[error("volume not found")]
    VolumeNotFound,

    #[error("multiple volumes found")]
    AmbiguousVolume,

    #[error("multiple ports found for MAC {mac}")]
    AmbiguousPort { mac: String },

    #[error("timed out waiting for {what} to become {status}")]
    StatusTimeout { what: &'static str, status: String },

    #[error("OpenStack API returned {status}: {body}")]
    Api { status: reqwest::StatusCode, body: String },

    #[error("transport error talking to OpenStack")]
    Transport(#[from] reqwest::Error),
}

/// Authenticated service clients sharing one keystone token.
pub struct ClientSet {
    http: reqwest::Client,
    token: String,
    volume_url: String,
    compute_url: String,
    network_url: String,
}

impl ClientSet {
    /// Authenticates with keystone from the `OS_*` environment and
    /// resolves the public service endpoints for the configured region.
    pub async fn from_env(log: &Logger) -> Result<Self, OpenstackError> {
        let auth_url = require_env("OS_AUTH_URL")?;
        let username = require_env("OS_USERNAME")?;
        let password = require_env("OS_PASSWORD")?;
        let project = require_env("OS_PROJECT_NAME")?;
        let user_domain = std::env::var("OS_USER_DOMAIN_NAME")
            .unwrap_or_else(|_| "Default".to_string());
        let project_domain = std::env::var("OS_PROJECT_DOMAIN_NAME")
            .unwrap_or_else(|_| "Default".to_string());
        let region = std::env::var("OS_REGION_NAME").ok();
        let insecure =
            std::env::var("OS_INSECURE").as_deref() == Ok("true");

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure)
            .user_agent("migratekit")
            .build()?;

        let mut tokens_url = auth_url.trim_end_matches('/').to_string();
        if !tokens_url.ends_with("/v3") {
            tokens_url.push_str("/v3");
        }
        tokens_url.push_str("/auth/tokens");

        let request = AuthRequest {
            auth: Auth {
                identity: Identity {
                    methods: vec!["password".to_string()],
                    password: PasswordMethod {
                        user: User {
                            name: username,
                            domain: Domain { name: user_domain },
                            password,
                        },
                    },
                },
                scope: Scope {
                    project: Project {
                        name: project,
                        domain: Domain { name: project_domain },
                    },
                },
            },
        };

        let resp = http.post(&tokens_url).json(&request).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(OpenstackError::Api { status, body });
        }
        let token = resp
            .headers()
            .get("x-subject-token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or(OpenstackError::NoToken)?;
        let body: TokenResponse = resp.json().await?;

        let volume_url = endpoint_url(
            &body.token.catalog,
            &["volumev3", "block-storage"],
            region.as_deref(),
        )
        .ok_or(OpenstackError::NoEndpoint { service: "volumev3" })?;
        let compute_url = endpoint_url(
            &body.token.catalog,
            &["compute"],
            region.as_deref(),
        )
        .ok_or(OpenstackError::NoEndpoint { service: "compute" })?;
        let network_url = endpoint_url(
            &body.token.catalog,
            &["network"],
            region.as_deref(),
        )
        .ok_or(OpenstackError::NoEndpoint { service: "network" })?;

        info!(log, "authenticated to OpenStack";
            "volume" => &volume_url, "compute" => &compute_url,
            "network" => &network_url);

        Ok(Self { http, token, volume_url, compute_url, network_url })
    }

    // Volumes

    /// Lists volumes filtered by exact name and, optionally, by metadata.
    pub async fn list_volumes(
        &self,
        name: &str,
        metadata: Option<&BTreeMap<String, String>>,
    ) -> Result<Vec<Volume>, OpenstackError> {
        let url = format!("{}/volumes/detail", self.volume_url);
        let mut query = vec![("name".to_string(), name.to_string())];
        if let Some(metadata) = metadata {
            // Cinder takes the metadata filter as a JSON object in the
            // query string.
            query.push((
                "metadata".to_string(),
                serde_json::to_string(metadata)
                    .expect("string map serializes"),
            ));
        }
        let resp: VolumesResponse = self.get(&url, &query).await?;
        Ok(resp.volumes)
    }

    pub async fn get_volume(
        &self,
        id: Uuid,
    ) -> Result<Volume, OpenstackError> {
        let url = format!("{}/volumes/{}", self.volume_url, id);
        let resp: VolumeResponse = self.get(&url, &[]).await?;
        Ok(resp.volume)
    }

    pub async fn create_volume(
        &self,
        name: &str,
        size_gib: i64,
        availability_zone: Option<&str>,
        volume_type: Option<&str>,
        metadata: BTreeMap<String, String>,
    ) -> Result<Volume, OpenstackError> {
        let url = format!("{}/volumes", self.volume_url);
        let request = VolumeCreateRequest {
            volume: VolumeCreate {
                name: name.to_string(),
                size: size_gib,
                availability_zone: availability_zone.map(str::to_string),
                volume_type: volume_type.map(str::to_string),
                metadata,
            },
        };
        let resp: VolumeResponse = self.post(&url, &request).await?;
        Ok(resp.volume)
    }

    pub async fn update_volume_metadata(
        &self,
        id: Uuid,
        metadata: BTreeMap<String, String>,
    ) -> Result<(), OpenstackError> {
        let url = format!("{}/volumes/{}", self.volume_url, id);
        let request =
            VolumeUpdateRequest { volume: VolumeUpdate { metadata } };
        let resp = self
            .http
            .put(&url)
            .header("X-Auth-Token", &self.token)
            .json(&request)
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    pub async fn set_volume_bootable(
        &self,
        id: Uuid,
    ) -> Result<(), OpenstackError> {
        self.volume_action(
            id,
            &serde_json::json!({ "os-set_bootable": { "bootable": true } }),
        )
        .await
    }

    pub async fn set_volume_image_metadata(
        &self,
        id: Uuid,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), OpenstackError> {
        self.volume_action(
            id,
            &serde_json::json!({
                "os-set_image_metadata": { "metadata": metadata }
            }),
        )
        .await
    }

    async fn volume_action(
        &self,
        id: Uuid,
        body: &serde_json::Value,
    ) -> Result<(), OpenstackError> {
        let url = format!("{}/volumes/{}/action", self.volume_url, id);
        let resp = self
            .http
            .post(&url)
            .header("X-Auth-Token", &self.token)
            .json(body)
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    /// Polls the volume until it reaches `status` or `timeout` elapses.
    pub async fn wait_for_volume_status(
        &self,
        id: Uuid,
        status: &str,
        timeout: Duration,
    ) -> Result<(), OpenstackError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.get_volume(id).await?.status == status {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(OpenstackError::StatusTimeout {
                    what: "volume",
                    status: status.to_string(),
                });
            }
            tokio::time::sleep(STATUS_POLL).await;
        }
    }

    // Compute

    pub async fn attach_volume(
        &self,
        server_id: &str,
        volume_id: Uuid,
    ) -> Result<(), OpenstackError> {
        let url = format!(
            "{}/servers/{}/os-volume_attachments",
            self.compute_url, server_id
        );
        let request = VolumeAttachRequest {
            volume_attachment: VolumeAttachment { volume_id },
        };
        let resp = self
            .http
            .post(&url)
            .header("X-Auth-Token", &self.token)
            .json(&request)
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    pub async fn detach_volume(
        &self,
        server_id: &str,
        volume_id: Uuid,
    ) -> Result<(), OpenstackError> {
        let url = format!(
            "{}/servers/{}/os-volume_attachments/{}",
            self.compute_url, server_id, volume_id
        );
        let resp = self
            .http
            .delete(&url)
            .header("X-Auth-Token", &self.token)
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    pub async fn get_flavor(
        &self,
        id: &str,
    ) -> Result<Flavor, OpenstackError> {
        let url = format!("{}/flavors/{}", self.compute_url, id);
        let resp: FlavorResponse = self.get(&url, &[]).await?;
        Ok(resp.flavor)
    }

    pub async fn create_server(
        &self,
        name: &str,
        flavor_ref: &str,
        ports: Vec<Uuid>,
        block_devices: Vec<BlockDeviceMapping>,
        availability_zone: Option<&str>,
    ) -> Result<Server, OpenstackError> {
        let url = format!("{}/servers", self.compute_url);
        let request = ServerCreateRequest {
            server: ServerCreate {
                name: name.to_string(),
                flavor_ref: flavor_ref.to_string(),
                networks: ports
                    .into_iter()
                    .map(|port| ServerNetwork { port })
                    .collect(),
                block_device_mapping_v2: block_devices,
                availability_zone: availability_zone.map(str::to_string),
            },
        };
        let resp: ServerResponse = self.post(&url, &request).await?;
        Ok(resp.server)
    }

    pub async fn wait_for_server_status(
        &self,
        id: Uuid,
        status: &str,
        timeout: Duration,
    ) -> Result<(), OpenstackError> {
        let url = format!("{}/servers/{}", self.compute_url, id);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let resp: ServerResponse = self.get(&url, &[]).await?;
            if resp.server.status.as_deref() == Some(status) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(OpenstackError::StatusTimeout {
                    what: "server",
                    status: status.to_string(),
                });
            }
            tokio::time::sleep(STATUS_POLL).await;
        }
    }

    // Networking

    pub async fn list_ports(
        &self,
        network_id: Uuid,
        mac_address: &str,
    ) -> Result<Vec<Port>, OpenstackError> {
        let url = format!("{}/v2.0/ports", self.network_url);
        let resp: PortsResponse = self
            .get(
                &url,
                &[
                    ("network_id".to_string(), network_id.to_string()),
                    ("mac_address".to_string(), mac_address.to_string()),
                ],
            )
            .await?;
        Ok(resp.ports)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_port(
        &self,
        network_id: Uuid,
        name: &str,
        description: &str,
        mac_address: &str,
        subnet_id: Uuid,
        ip_address: Option<String>,
        security_groups: Option<Vec<String>>,
    ) -> Result<Port, OpenstackError> {
        let url = format!("{}/v2.0/ports", self.network_url);
        let request = PortCreateRequest {
            port: PortCreate {
                network_id,
                name: name.to_string(),
                description: description.to_string(),
                mac_address: mac_address.to_string(),
                fixed_ips: vec![FixedIp { subnet_id, ip_address }],
                security_groups,
            },
        };
        let resp: PortResponse = self.post(&url, &request).await?;
        Ok(resp.port)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<T, OpenstackError> {
        let resp = self
            .http
            .get(url)
            .query(query)
            .header("X-Auth-Token", &self.token)
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }

    async fn post<T: DeserializeOwned>(
        &self,
        url: &str,
        body: &impl Serialize,
    ) -> Result<T, OpenstackError> {
        let resp = self
            .http
            .post(url)
            .header("X-Auth-Token", &self.token)
            .json(body)
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }
}

/// The UUID of the instance this process runs on, from the link-local
/// metadata service.
pub async fn current_instance_uuid() -> Result<String, OpenstackError> {
    let resp = reqwest::get(METADATA_URL).await?;
    let metadata: InstanceMetadata = check(resp).await?.json().await?;
    Ok(metadata.uuid)
}

async fn check(
    resp: reqwest::Response,
) -> Result<reqwest::Response, OpenstackError> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        let body = resp.text().await.unwrap_or_default();
        Err(OpenstackError::Api { status, body })
    }
}

fn require_env(name: &'static str) -> Result<String, OpenstackError> {
    std::env::var(name).map_err(|_| OpenstackError::MissingEnv(name))
}

fn endpoint_url(
    catalog: &[CatalogEntry],
    service_types: &[&str],
    region: Option<&str>,
) -> Option<String> {
    catalog
        .iter()
        .filter(|entry| service_types.contains(&entry.service_type.as_str()))
        .flat_map(|entry| entry.endpoints.iter())
        .find(|ep| {
            ep.interface == "public"
                && region
                    .map(|r| ep.region.as_deref() == Some(r))
                    .unwrap_or(true)
        })
        .map(|ep| ep.url.trim_end_matches('/').to_string())
}

#[cfg(test)]
mod test {
    use super::*;

    fn catalog() -> Vec<CatalogEntry> {
        serde_json::from_str(
            r#"[
                {
                    "type": "volumev3",
                    "endpoints": [
                        {"interface": "internal", "region": "RegionOne",
                         "url": "https://internal:8776/v3/p1"},
                        {"interface": "public", "region": "RegionOne",
                         "url": "https://cinder:8776/v3/p1/"},
                        {"interface": "public", "region": "RegionTwo",
                         "url": "https://cinder2:8776/v3/p1"}
                    ]
                },
                {
                    "type": "compute",
                    "endpoints": [
                        {"interface": "public", "region": "RegionOne",
                         "url": "https://nova:8774/v2.1"}
                    ]
                }
            ]"#,
        )
        .unwrap()
    }

    #[test]
    fn picks_public_endpoint_for_region() {
        let catalog = catalog();
        assert_eq!(
            endpoint_url(&catalog, &["volumev3"], Some("RegionTwo"))
                .as_deref(),
            Some("https://cinder2:8776/v3/p1")
        );
        // Trailing slashes are trimmed so url joining stays simple.
        assert_eq!(
            endpoint_url(&catalog, &["volumev3"], Some("RegionOne"))
                .as_deref(),
            Some("https://cinder:8776/v3/p1")
        );
        // Without a region, the first public endpoint wins.
        assert_eq!(
            endpoint_url(&catalog, &["compute"], None).as_deref(),
            Some("https://nova:8774/v2.1")
        );
        assert_eq!(endpoint_url(&catalog, &["network"], None), None);
    }

    #[test]
    fn deserializes_volume_listings() {
        let body = r#"{
            "volumes": [{
                "id": "0aa27e4b-3d5f-4d1a-8df3-b4f87e31d451",
                "name": "guest-2000",
                "status": "available",
                "size": 40,
                "metadata": {
                    "migrate_kit": "true",
                    "vm": "vm-20",
                    "disk": "2000",
                    "change_id": "52aa/31"
                }
            }]
        }"#;
        let resp: VolumesResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.volumes.len(), 1);
        let volume = &resp.volumes[0];
        assert_eq!(volume.status, "available");
        assert_eq!(volume.size, 40);
        assert_eq!(
            volume.metadata.get("change_id").map(String::as_str),
            Some("52aa/31")
        );
    }

    #[test]
    fn server_create_body_shape() {
        let request = ServerCreateRequest {
            server: ServerCreate {
                name: "guest".to_string(),
                flavor_ref: "m1.large".to_string(),
                networks: vec![ServerNetwork {
                    port: Uuid::from_u128(7),
                }],
                block_device_mapping_v2: vec![BlockDeviceMapping {
                    boot_index: 0,
                    uuid: Uuid::from_u128(9),
                    source_type: "volume".to_string(),
                    destination_type: "volume".to_string(),
                }],
                availability_zone: Some("nova".to_string()),
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["server"]["flavorRef"], "m1.large");
        assert_eq!(
            value["server"]["block_device_mapping_v2"][0]["boot_index"],
            0
        );
        assert_eq!(
            value["server"]["networks"][0]["port"],
            Uuid::from_u128(7).to_string()
        );
    }
}
