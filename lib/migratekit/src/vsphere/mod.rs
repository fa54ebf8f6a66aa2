// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A hand-written client for the slice of the vim25 SOAP API that disk
//! replication needs: session login, property retrieval, snapshot and power
//! tasks, and `QueryChangedDiskAreas`.
//!
//! Requests are formatted directly as `urn:vim25` envelopes; responses are
//! picked apart with a read-only XML DOM. The session rides on the
//! `vmware_soap_session` cookie, which the HTTP client's cookie store
//! carries across calls.

mod types;

use std::time::Duration;

use roxmltree::Document;
use thiserror::Error;

use crate::progress::ProgressSink;

pub use types::{
    ChangedDiskArea, DiskBacking, DiskChangeInfo, Firmware,
    ManagedObjectReference, Nic, PowerState, TaskInfo, TaskState, VirtualDisk,
    VmFacts,
};
use types::{child_text, is_elem};

/// Cadence of task and power-state polling.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum VsphereError {
    #[error("transport error talking to vSphere")]
    Transport(#[from] reqwest::Error),

    #[error("vSphere endpoint returned HTTP {0}")]
    Status(reqwest::StatusCode),

    #[error("SOAP fault: {0}")]
    Fault(String),

    #[error("malformed response document")]
    Xml(#[from] roxmltree::Error),

    #[error("response is missing {0}")]
    MissingField(&'static str),

    #[error("task failed: {0}")]
    TaskFailed(String),
}

pub struct Client {
    http: reqwest::Client,
    sdk_url: String,
    session_manager: String,
    property_collector: String,
    search_index: String,
}

impl Client {
    /// Connects to `https://<host>/sdk` and retrieves the service content
    /// that names the session manager, property collector and search index.
    pub async fn connect(host: &str) -> Result<Self, VsphereError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .cookie_store(true)
            .build()?;

        let mut client = Self {
            http,
            sdk_url: format!("https://{}/sdk", host),
            session_manager: "SessionManager".to_string(),
            property_collector: "propertyCollector".to_string(),
            search_index: "SearchIndex".to_string(),
        };

        let xml = client
            .call(
                "<RetrieveServiceContent xmlns=\"urn:vim25\">\
                 <_this type=\"ServiceInstance\">ServiceInstance</_this>\
                 </RetrieveServiceContent>"
                    .to_string(),
            )
            .await?;
        let doc = Document::parse(&xml)?;
        for (field, slot) in [
            ("sessionManager", &mut client.session_manager),
            ("propertyCollector", &mut client.property_collector),
            ("searchIndex", &mut client.search_index),
        ] {
            if let Some(text) = doc
                .descendants()
                .find(|n| is_elem(*n, field))
                .and_then(|n| n.text())
            {
                *slot = text.to_string();
            }
        }

        Ok(client)
    }

    pub async fn login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(), VsphereError> {
        self.call(format!(
            "<Login xmlns=\"urn:vim25\">\
             <_this type=\"SessionManager\">{}</_this>\
             <userName>{}</userName><password>{}</password>\
             </Login>",
            esc(&self.session_manager),
            esc(username),
            esc(password),
        ))
        .await?;
        Ok(())
    }

    /// Resolves an inventory path like `/Datacenter/vm/guest` to a managed
    /// object reference, or `None` when nothing lives there.
    pub async fn find_by_inventory_path(
        &self,
        path: &str,
    ) -> Result<Option<ManagedObjectReference>, VsphereError> {
        let xml = self
            .call(format!(
                "<FindByInventoryPath xmlns=\"urn:vim25\">\
                 <_this type=\"SearchIndex\">{}</_this>\
                 <inventoryPath>{}</inventoryPath>\
                 </FindByInventoryPath>",
                esc(&self.search_index),
                esc(path),
            ))
            .await?;
        let doc = Document::parse(&xml)?;
        Ok(doc
            .descendants()
            .find(|n| is_elem(*n, "returnval"))
            .and_then(ManagedObjectReference::from_node))
    }

    pub async fn vm_facts(
        &self,
        vm: &ManagedObjectReference,
    ) -> Result<VmFacts, VsphereError> {
        let xml = self
            .retrieve_properties(
                vm,
                &["name", "config.firmware", "config.guestId"],
            )
            .await?;
        let doc = Document::parse(&xml)?;
        let name = prop_text(&doc, "name")
            .ok_or(VsphereError::MissingField("name"))?
            .to_string();
        let firmware = match prop_text(&doc, "config.firmware") {
            Some("efi") => Firmware::Efi,
            _ => Firmware::Bios,
        };
        let guest_id = prop_text(&doc, "config.guestId")
            .unwrap_or_default()
            .to_string();
        Ok(VmFacts { moref: vm.clone(), name, firmware, guest_id })
    }

    pub async fn change_tracking_enabled(
        &self,
        vm: &ManagedObjectReference,
    ) -> Result<bool, VsphereError> {
        let xml = self
            .retrieve_properties(vm, &["config.changeTrackingEnabled"])
            .await?;
        let doc = Document::parse(&xml)?;
        Ok(prop_text(&doc, "config.changeTrackingEnabled") == Some("true"))
    }

    pub async fn power_state(
        &self,
        vm: &ManagedObjectReference,
    ) -> Result<PowerState, VsphereError> {
        let xml =
            self.retrieve_properties(vm, &["runtime.powerState"]).await?;
        let doc = Document::parse(&xml)?;
        prop_text(&doc, "runtime.powerState")
            .and_then(PowerState::from_vim)
            .ok_or(VsphereError::MissingField("runtime.powerState"))
    }

    /// Finds a snapshot of `vm` by name anywhere in the snapshot tree.
    pub async fn find_snapshot(
        &self,
        vm: &ManagedObjectReference,
        name: &str,
    ) -> Result<Option<ManagedObjectReference>, VsphereError> {
        let xml = self.retrieve_properties(vm, &["snapshot"]).await?;
        find_snapshot_in(&xml, name)
    }

    /// Enumerates the `VirtualDisk` devices of a snapshot (or of the live
    /// VM when handed a `VirtualMachine` reference).
    pub async fn hardware_disks(
        &self,
        obj: &ManagedObjectReference,
    ) -> Result<Vec<VirtualDisk>, VsphereError> {
        let xml =
            self.retrieve_properties(obj, &["config.hardware.device"]).await?;
        parse_disks(&xml)
    }

    /// Enumerates the ethernet devices of the VM.
    pub async fn vm_nics(
        &self,
        vm: &ManagedObjectReference,
    ) -> Result<Vec<Nic>, VsphereError> {
        let xml =
            self.retrieve_properties(vm, &["config.hardware.device"]).await?;
        parse_nics(&xml)
    }

    pub async fn create_snapshot(
        &self,
        vm: &ManagedObjectReference,
        name: &str,
        description: &str,
        memory: bool,
        quiesce: bool,
    ) -> Result<ManagedObjectReference, VsphereError> {
        let xml = self
            .call(format!(
                "<CreateSnapshot_Task xmlns=\"urn:vim25\">\
                 <_this type=\"VirtualMachine\">{}</_this>\
                 <name>{}</name><description>{}</description>\
                 <memory>{}</memory><quiesce>{}</quiesce>\
                 </CreateSnapshot_Task>",
                esc(&vm.value),
                esc(name),
                esc(description),
                memory,
                quiesce,
            ))
            .await?;
        returnval_moref(&xml)
    }

    pub async fn remove_snapshot(
        &self,
        snapshot: &ManagedObjectReference,
        consolidate: bool,
    ) -> Result<ManagedObjectReference, VsphereError> {
        let xml = self
            .call(format!(
                "<RemoveSnapshot_Task xmlns=\"urn:vim25\">\
                 <_this type=\"VirtualMachineSnapshot\">{}</_this>\
                 <removeChildren>false</removeChildren>\
                 <consolidate>{}</consolidate>\
                 </RemoveSnapshot_Task>",
                esc(&snapshot.value),
                consolidate,
            ))
            .await?;
        returnval_moref(&xml)
    }

    pub async fn shutdown_guest(
        &self,
        vm: &ManagedObjectReference,
    ) -> Result<(), VsphereError> {
        self.call(format!(
            "<ShutdownGuest xmlns=\"urn:vim25\">\
             <_this type=\"VirtualMachine\">{}</_this>\
             </ShutdownGuest>",
            esc(&vm.value),
        ))
        .await?;
        Ok(())
    }

    pub async fn query_changed_disk_areas(
        &self,
        vm: &ManagedObjectReference,
        snapshot: &ManagedObjectReference,
        device_key: i32,
        start_offset: i64,
        change_id: &str,
    ) -> Result<DiskChangeInfo, VsphereError> {
        let xml = self
            .call(format!(
                "<QueryChangedDiskAreas xmlns=\"urn:vim25\">\
                 <_this type=\"VirtualMachine\">{}</_this>\
                 <snapshot type=\"VirtualMachineSnapshot\">{}</snapshot>\
                 <deviceKey>{}</deviceKey>\
                 <startOffset>{}</startOffset>\
                 <changeId>{}</changeId>\
                 </QueryChangedDiskAreas>",
                esc(&vm.value),
                esc(&snapshot.value),
                device_key,
                start_offset,
                esc(change_id),
            ))
            .await?;
        parse_disk_change_info(&xml)
    }

    pub async fn task_info(
        &self,
        task: &ManagedObjectReference,
    ) -> Result<TaskInfo, VsphereError> {
        let xml = self
            .retrieve_properties(
                task,
                &["info.state", "info.progress", "info.error", "info.result"],
            )
            .await?;
        parse_task_info(&xml)
    }

    /// Polls a task to completion, feeding reported percentages to `sink`
    /// under the given label. Returns the task result reference, if any.
    pub async fn wait_for_task(
        &self,
        task: &ManagedObjectReference,
        sink: &dyn ProgressSink,
        label: &str,
    ) -> Result<Option<ManagedObjectReference>, VsphereError> {
        loop {
            let info = self.task_info(task).await?;
            match info.state {
                TaskState::Success => {
                    sink.emit(100, label);
                    return Ok(info.result);
                }
                TaskState::Error => {
                    return Err(VsphereError::TaskFailed(
                        info.error.unwrap_or_else(|| "unknown".to_string()),
                    ));
                }
                TaskState::Queued | TaskState::Running => {
                    if let Some(pct) = info.progress {
                        sink.emit(pct.clamp(0, 100) as u8, label);
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    }

    pub async fn wait_for_power_state(
        &self,
        vm: &ManagedObjectReference,
        desired: PowerState,
    ) -> Result<(), VsphereError> {
        loop {
            if self.power_state(vm).await? == desired {
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn retrieve_properties(
        &self,
        obj: &ManagedObjectReference,
        paths: &[&str],
    ) -> Result<String, VsphereError> {
        let path_set: String = paths
            .iter()
            .map(|p| format!("<pathSet>{}</pathSet>", esc(p)))
            .collect();
        self.call(format!(
            "<RetrieveProperties xmlns=\"urn:vim25\">\
             <_this type=\"PropertyCollector\">{}</_this>\
             <specSet>\
             <propSet><type>{}</type>{}</propSet>\
             <objectSet><obj type=\"{}\">{}</obj></objectSet>\
             </specSet>\
             </RetrieveProperties>",
            esc(&self.property_collector),
            esc(&obj.kind),
            path_set,
            esc(&obj.kind),
            esc(&obj.value),
        ))
        .await
    }

    /// One SOAP round trip. Faults are surfaced as errors whether or not
    /// the endpoint also set an HTTP error status.
    async fn call(&self, body: String) -> Result<String, VsphereError> {
        let envelope = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <soapenv:Envelope \
             xmlns:soapenv=\"http://schemas.xmlsoap.org/soap/envelope/\" \
             xmlns:xsd=\"http://www.w3.org/2001/XMLSchema\" \
             xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\">\
             <soapenv:Body>{}</soapenv:Body></soapenv:Envelope>",
            body
        );
        let resp = self
            .http
            .post(&self.sdk_url)
            .header(reqwest::header::CONTENT_TYPE, "text/xml; charset=utf-8")
            .header("SOAPAction", "urn:vim25/8.0.0.0")
            .body(envelope)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if let Ok(doc) = Document::parse(&text) {
            if let Some(fault) = fault_string(&doc) {
                return Err(VsphereError::Fault(fault));
            }
        }
        if !status.is_success() {
            return Err(VsphereError::Status(status));
        }
        Ok(text)
    }
}

fn fault_string(doc: &Document) -> Option<String> {
    doc.descendants()
        .find(|n| is_elem(*n, "Fault"))
        .map(|fault| {
            child_text(fault, "faultstring")
                .unwrap_or("unspecified SOAP fault")
                .to_string()
        })
}

fn prop_text<'input>(
    doc: &'input Document<'input>,
    name: &str,
) -> Option<&'input str> {
    prop_val(doc, name).and_then(|n| n.text())
}

fn prop_val<'a, 'input>(
    doc: &'a Document<'input>,
    name: &str,
) -> Option<roxmltree::Node<'a, 'input>> {
    doc.descendants()
        .filter(|n| is_elem(*n, "propSet"))
        .find(|ps| child_text(*ps, "name") == Some(name))
        .and_then(|ps| ps.children().find(|n| is_elem(*n, "val")))
}

fn returnval_moref(
    xml: &str,
) -> Result<ManagedObjectReference, VsphereError> {
    let doc = Document::parse(xml)?;
    doc.descendants()
        .find(|n| is_elem(*n, "returnval"))
        .and_then(ManagedObjectReference::from_node)
        .ok_or(VsphereError::MissingField("returnval"))
}

fn parse_disks(xml: &str) -> Result<Vec<VirtualDisk>, VsphereError> {
    let doc = Document::parse(xml)?;
    let val = prop_val(&doc, "config.hardware.device")
        .ok_or(VsphereError::MissingField("config.hardware.device"))?;
    Ok(val
        .children()
        .filter_map(VirtualDisk::from_device_node)
        .collect())
}

fn parse_nics(xml: &str) -> Result<Vec<Nic>, VsphereError> {
    let doc = Document::parse(xml)?;
    let val = prop_val(&doc, "config.hardware.device")
        .ok_or(VsphereError::MissingField("config.hardware.device"))?;
    Ok(val
        .children()
        .filter(|dev| dev.is_element())
        .filter_map(|dev| {
            let mac = child_text(dev, "macAddress")?;
            let info =
                dev.children().find(|n| is_elem(*n, "deviceInfo"))?;
            Some(Nic {
                mac_address: mac.to_string(),
                label: child_text(info, "label").unwrap_or_default().to_string(),
                summary: child_text(info, "summary")
                    .unwrap_or_default()
                    .to_string(),
            })
        })
        .collect())
}

fn parse_task_info(xml: &str) -> Result<TaskInfo, VsphereError> {
    let doc = Document::parse(xml)?;
    let state = prop_text(&doc, "info.state")
        .and_then(TaskState::from_vim)
        .ok_or(VsphereError::MissingField("info.state"))?;
    let progress =
        prop_text(&doc, "info.progress").and_then(|p| p.parse().ok());
    let error = prop_val(&doc, "info.error")
        .map(|err| {
            child_text(err, "localizedMessage")
                .unwrap_or("unspecified task error")
                .to_string()
        });
    let result = prop_val(&doc, "info.result")
        .and_then(ManagedObjectReference::from_node);
    Ok(TaskInfo { state, progress, result, error })
}

fn parse_disk_change_info(
    xml: &str,
) -> Result<DiskChangeInfo, VsphereError> {
    let doc = Document::parse(xml)?;
    let ret = doc
        .descendants()
        .find(|n| is_elem(*n, "returnval"))
        .ok_or(VsphereError::MissingField("returnval"))?;
    let start_offset = child_text(ret, "startOffset")
        .and_then(|v| v.parse().ok())
        .ok_or(VsphereError::MissingField("startOffset"))?;
    let length = child_text(ret, "length")
        .and_then(|v| v.parse().ok())
        .ok_or(VsphereError::MissingField("length"))?;
    let changed_area = ret
        .children()
        .filter(|n| is_elem(*n, "changedArea"))
        .map(|area| {
            let start = child_text(area, "start")
                .and_then(|v| v.parse().ok())
                .ok_or(VsphereError::MissingField("changedArea.start"))?;
            let length = child_text(area, "length")
                .and_then(|v| v.parse().ok())
                .ok_or(VsphereError::MissingField("changedArea.length"))?;
            Ok(ChangedDiskArea { start, length })
        })
        .collect::<Result<Vec<_>, VsphereError>>()?;
    Ok(DiskChangeInfo { start_offset, length, changed_area })
}

fn find_snapshot_in(
    xml: &str,
    name: &str,
) -> Result<Option<ManagedObjectReference>, VsphereError> {
    let doc = Document::parse(xml)?;
    let Some(val) = prop_val(&doc, "snapshot") else {
        return Ok(None);
    };
    Ok(val
        .descendants()
        .filter(|n| {
            is_elem(*n, "rootSnapshotList")
                || is_elem(*n, "childSnapshotList")
        })
        .find(|n| child_text(*n, "name") == Some(name))
        .and_then(|n| n.children().find(|c| is_elem(*c, "snapshot")))
        .and_then(ManagedObjectReference::from_node))
}

fn esc(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    const XSI_ATTR: &str =
        "xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\"";

    fn props_response(prop_sets: &str) -> String {
        format!(
            "<soapenv:Envelope \
             xmlns:soapenv=\"http://schemas.xmlsoap.org/soap/envelope/\" \
             {XSI_ATTR}><soapenv:Body>\
             <RetrievePropertiesResponse xmlns=\"urn:vim25\">\
             <returnval>\
             <obj type=\"VirtualMachine\">vm-20</obj>{prop_sets}\
             </returnval>\
             </RetrievePropertiesResponse>\
             </soapenv:Body></soapenv:Envelope>"
        )
    }

    #[test]
    fn parses_disks_from_device_list() {
        let xml = props_response(
            "<propSet><name>config.hardware.device</name>\
             <val xsi:type=\"ArrayOfVirtualDevice\">\
             <VirtualDevice xsi:type=\"VirtualLsiLogicController\">\
             <key>1000</key></VirtualDevice>\
             <VirtualDevice xsi:type=\"VirtualDisk\">\
             <key>2000</key>\
             <backing xsi:type=\"VirtualDiskFlatVer2BackingInfo\">\
             <fileName>[ds1] guest/guest.vmdk</fileName>\
             <changeId>52aa/31</changeId>\
             </backing>\
             <capacityInBytes>42949672960</capacityInBytes>\
             <diskObjectId>20-2000</diskObjectId>\
             </VirtualDevice>\
             </val></propSet>",
        );
        let disks = parse_disks(&xml).unwrap();
        assert_eq!(disks.len(), 1);
        let disk = &disks[0];
        assert_eq!(disk.key, 2000);
        assert_eq!(disk.capacity_in_bytes, 42949672960);
        assert_eq!(disk.disk_object_id.as_deref(), Some("20-2000"));
        assert_eq!(disk.backing.file_name(), Some("[ds1] guest/guest.vmdk"));
        assert_eq!(disk.backing.change_id(), Some("52aa/31"));
    }

    #[test]
    fn parses_nics_from_device_list() {
        let xml = props_response(
            "<propSet><name>config.hardware.device</name>\
             <val xsi:type=\"ArrayOfVirtualDevice\">\
             <VirtualDevice xsi:type=\"VirtualVmxnet3\">\
             <key>4000</key>\
             <deviceInfo><label>Network adapter 1</label>\
             <summary>VM Network</summary></deviceInfo>\
             <macAddress>00:50:56:aa:bb:cc</macAddress>\
             </VirtualDevice>\
             </val></propSet>",
        );
        let nics = parse_nics(&xml).unwrap();
        assert_eq!(nics.len(), 1);
        assert_eq!(nics[0].mac_address, "00:50:56:aa:bb:cc");
        assert_eq!(nics[0].label, "Network adapter 1");
    }

    #[test]
    fn parses_changed_disk_areas() {
        let xml = "<soapenv:Envelope \
             xmlns:soapenv=\"http://schemas.xmlsoap.org/soap/envelope/\">\
             <soapenv:Body>\
             <QueryChangedDiskAreasResponse xmlns=\"urn:vim25\">\
             <returnval>\
             <startOffset>0</startOffset>\
             <length>1073741824</length>\
             <changedArea><start>65536</start><length>131072</length>\
             </changedArea>\
             <changedArea><start>1048576</start><length>65536</length>\
             </changedArea>\
             </returnval>\
             </QueryChangedDiskAreasResponse>\
             </soapenv:Body></soapenv:Envelope>";
        let info = parse_disk_change_info(xml).unwrap();
        assert_eq!(info.start_offset, 0);
        assert_eq!(info.length, 1073741824);
        assert_eq!(
            info.changed_area,
            vec![
                ChangedDiskArea { start: 65536, length: 131072 },
                ChangedDiskArea { start: 1048576, length: 65536 },
            ]
        );
    }

    #[test]
    fn parses_task_info_states() {
        let xml = props_response(
            "<propSet><name>info.state</name>\
             <val xsi:type=\"TaskInfoState\">running</val></propSet>\
             <propSet><name>info.progress</name>\
             <val xsi:type=\"xsd:int\">37</val></propSet>",
        );
        let info = parse_task_info(&xml).unwrap();
        assert_eq!(info.state, TaskState::Running);
        assert_eq!(info.progress, Some(37));
        assert!(info.error.is_none());

        let xml = props_response(
            "<propSet><name>info.state</name>\
             <val xsi:type=\"TaskInfoState\">error</val></propSet>\
             <propSet><name>info.error</name>\
             <val xsi:type=\"LocalizedMethodFault\">\
             <localizedMessage>Snapshot consolidation failed\
             </localizedMessage></val></propSet>",
        );
        let info = parse_task_info(&xml).unwrap();
        assert_eq!(info.state, TaskState::Error);
        assert_eq!(
            info.error.as_deref(),
            Some("Snapshot consolidation failed")
        );
    }

    #[test]
    fn task_result_is_a_moref() {
        let xml = props_response(
            "<propSet><name>info.state</name>\
             <val xsi:type=\"TaskInfoState\">success</val></propSet>\
             <propSet><name>info.result</name>\
             <val type=\"VirtualMachineSnapshot\" \
             xsi:type=\"ManagedObjectReference\">snapshot-77</val>\
             </propSet>",
        );
        let info = parse_task_info(&xml).unwrap();
        assert_eq!(
            info.result,
            Some(ManagedObjectReference::new(
                "VirtualMachineSnapshot",
                "snapshot-77"
            ))
        );
    }

    #[test]
    fn finds_nested_snapshot_by_name() {
        let xml = props_response(
            "<propSet><name>snapshot</name>\
             <val xsi:type=\"VirtualMachineSnapshotInfo\">\
             <currentSnapshot type=\"VirtualMachineSnapshot\">snapshot-9\
             </currentSnapshot>\
             <rootSnapshotList>\
             <snapshot type=\"VirtualMachineSnapshot\">snapshot-3</snapshot>\
             <name>before-upgrade</name>\
             <childSnapshotList>\
             <snapshot type=\"VirtualMachineSnapshot\">snapshot-9</snapshot>\
             <name>migratekit</name>\
             </childSnapshotList>\
             </rootSnapshotList>\
             </val></propSet>",
        );
        let found = find_snapshot_in(&xml, "migratekit").unwrap();
        assert_eq!(
            found,
            Some(ManagedObjectReference::new(
                "VirtualMachineSnapshot",
                "snapshot-9"
            ))
        );
        assert_eq!(find_snapshot_in(&xml, "nope").unwrap(), None);
    }

    #[test]
    fn surfaces_soap_faults() {
        let xml = "<soapenv:Envelope \
             xmlns:soapenv=\"http://schemas.xmlsoap.org/soap/envelope/\">\
             <soapenv:Body><soapenv:Fault>\
             <faultcode>ServerFaultCode</faultcode>\
             <faultstring>The session is not authenticated.</faultstring>\
             </soapenv:Fault></soapenv:Body></soapenv:Envelope>";
        let doc = Document::parse(xml).unwrap();
        assert_eq!(
            fault_string(&doc).as_deref(),
            Some("The session is not authenticated.")
        );
    }

    #[test]
    fn escapes_markup_in_requests() {
        assert_eq!(esc("a<b>&\"c'"), "a&lt;b&gt;&amp;&quot;c&apos;");
    }
}
