//! # Benchmark Orchestration
//!
//! High-level actions behind the CLI: provision each instance group, wire the
//! control plane (cloud config, pool, virtual service), register service
//! engines and wait for them to come healthy, and start or stop the load.
//!
//! Everything here absorbs failures: a step that cannot complete logs and
//! leaves the system partially configured for the next run to pick up.
//! Only config problems abort the process, and that happens before this
//! module is reached.

use std::collections::HashSet;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::{CloudConfig, InstanceTemplate};
use crate::control_plane::ControlPlaneApi;
use crate::fleet::{CreateMode, FleetReconciler, ProvisioningRequest};
use crate::poll::{wait_for_ready, ReadinessConfig};
use crate::provider::{ComputeProvider, InstanceRecord, Scope};
use crate::remote::RemoteTaskRunner;
use crate::tasks::RemoteTask;

/// Install fan-out proceeds over address slices of this size
const INSTALL_CHUNK: usize = 10;

/// Engine names are `<address>--<generated-suffix>`; the stable key is the
/// part before the separator.
const ENGINE_NAME_SEPARATOR: &str = "--";

/// Bundles the collaborators every action needs
pub struct Orchestrator<'a> {
    pub cloud: &'a CloudConfig,
    pub provider: &'a dyn ComputeProvider,
    pub control_plane: &'a dyn ControlPlaneApi,
    pub runner: &'a dyn RemoteTaskRunner,
}

fn addresses(records: &[InstanceRecord]) -> Vec<String> {
    records
        .iter()
        .map(|record| record.network_address.clone())
        .filter(|addr| !addr.is_empty())
        .collect()
}

fn engine_is_ready(engine: &Value) -> bool {
    engine
        .pointer("/oper_status/state")
        .and_then(Value::as_str)
        .map(|state| state == "OPER_UP")
        .unwrap_or(false)
}

fn engine_key(engine: &Value) -> String {
    let name = engine.get("name").and_then(Value::as_str).unwrap_or_default();
    name.split(ENGINE_NAME_SEPARATOR)
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Host entries missing from the cloud config's linuxserver host list
fn host_entries_to_add(cloud_obj: &Value, candidates: &[String]) -> Vec<Value> {
    let registered: HashSet<&str> = cloud_obj
        .pointer("/linuxserver_configuration/hosts")
        .and_then(Value::as_array)
        .map(|hosts| {
            hosts
                .iter()
                .filter_map(|host| host.pointer("/host_ip/addr").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    candidates
        .iter()
        .filter(|addr| !registered.contains(addr.as_str()))
        .map(|addr| {
            json!({
                "host_ip": {"addr": addr, "type": "V4"},
                "host_attr": [
                    {"attr_key": "CPU", "attr_val": "All"},
                    {"attr_key": "MEMORY", "attr_val": "All"},
                    {"attr_key": "DPDK", "attr_val": "No"},
                    {"attr_key": "SE_INBAND_MGMT", "attr_val": "False"},
                ],
            })
        })
        .collect()
}

fn pool_body(name: &str, addrs: &[String]) -> Value {
    let servers: Vec<Value> = addrs
        .iter()
        .map(|addr| json!({"ip": {"type": "V4", "addr": addr}, "port": 80}))
        .collect();
    json!({"name": name, "servers": servers})
}

fn datascript_body(name: &str) -> Value {
    json!({
        "name": name,
        "datascript": [{
            "evt": "VS_DATASCRIPT_EVT_HTTP_REQ",
            "script": "avi.http.response(200)",
        }],
    })
}

fn subnet_parts(cidr: &str) -> (String, String) {
    let mut parts = cidr.splitn(2, '/');
    let prefix = parts.next().unwrap_or_default().to_string();
    let mask = parts.next().unwrap_or_default().to_string();
    (prefix, mask)
}

impl<'a> Orchestrator<'a> {
    fn reconciler_for(&self, template: &InstanceTemplate) -> FleetReconciler<'_> {
        FleetReconciler::new(
            self.provider,
            Scope::new(template.project.clone(), template.zone.clone()),
        )
    }

    fn request(
        &self,
        prefix: String,
        template: &InstanceTemplate,
        mode: CreateMode,
    ) -> ProvisioningRequest {
        ProvisioningRequest {
            group_prefix: prefix,
            desired_count: template.instances,
            template: template.clone(),
            ssh_user: self.cloud.ssh_username.clone(),
            ssh_public_key: self.cloud.ssh_public_key.clone(),
            mode,
        }
    }

    /// Provision load-generator instances. Package installs force the sync
    /// path so addresses are known before the SSH fan-out; otherwise the
    /// shortfall goes out as one batch.
    pub async fn create_client(&self) -> Vec<InstanceRecord> {
        let template = &self.cloud.client;
        let prefix = self.cloud.client_prefix();
        let reconciler = self.reconciler_for(template);
        let instances = if template.package_install {
            let instances = reconciler
                .reconcile(&self.request(prefix.clone(), template, CreateMode::Sync { wait: true }))
                .await;
            let addrs = addresses(&instances);
            info!("installing benchmark tools on {} instances", addrs.len());
            for chunk in addrs.chunks(INSTALL_CHUNK) {
                self.runner
                    .run(
                        &RemoteTask::InstallBenchTools {
                            image_family: template.image_family.clone(),
                        },
                        chunk,
                    )
                    .await;
            }
            instances
        } else {
            reconciler
                .reconcile(&self.request(prefix.clone(), template, CreateMode::Async))
                .await
        };
        info!(
            "{} client instances running for prefix {prefix}",
            instances.len()
        );
        instances
    }

    /// Provision pool backends and start the backend container on each
    pub async fn create_pool(&self) -> Vec<InstanceRecord> {
        let template = &self.cloud.pool;
        let prefix = self.cloud.pool_prefix();
        let instances = self
            .reconciler_for(template)
            .reconcile(&self.request(prefix.clone(), template, CreateMode::Sync { wait: true }))
            .await;
        if instances.len() < template.instances {
            warn!(
                "just {} pool instances running, {} requested",
                instances.len(),
                template.instances
            );
            return instances;
        }
        let addrs = addresses(&instances);
        if template.package_install {
            self.runner
                .run(
                    &RemoteTask::InstallDocker {
                        image_family: template.image_family.clone(),
                    },
                    &addrs,
                )
                .await;
        }
        self.runner
            .run(
                &RemoteTask::StartBackendServer {
                    image: template.backend_image.clone(),
                },
                &addrs,
            )
            .await;
        instances
    }

    /// Provision service-engine instances, register them with the cloud
    /// config, and wait until the target count is healthy. Returns the
    /// number of engines that came up.
    pub async fn create_engines(&self) -> usize {
        let template = &self.cloud.engine;
        let prefix = self.cloud.engine_prefix();
        let instances = self
            .reconciler_for(template)
            .reconcile(&self.request(prefix.clone(), template, CreateMode::Sync { wait: true }))
            .await;
        if instances.len() < template.instances {
            warn!(
                "just {} engine instances running, {} requested",
                instances.len(),
                template.instances
            );
            return 0;
        }
        let addrs = addresses(&instances);
        if template.package_install {
            self.runner
                .run(
                    &RemoteTask::InstallDocker {
                        image_family: template.image_family.clone(),
                    },
                    &addrs,
                )
                .await;
        }
        self.register_engine_hosts(&addrs).await;

        let ready = wait_for_ready(
            || self.list_engines(),
            engine_is_ready,
            engine_key,
            template.instances,
            &ReadinessConfig::default(),
        )
        .await;
        info!("{} engines up", ready.len());
        ready.len()
    }

    async fn list_engines(&self) -> Result<Vec<Value>, String> {
        let response = self
            .control_plane
            .get_list("serviceengine")
            .await
            .map_err(|err| err.to_string())?;
        if !response.is_success() {
            return Err(format!("serviceengine list returned {}", response.status));
        }
        Ok(response
            .body
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Add engine addresses to the cloud config's host list, skipping ones
    /// already registered
    async fn register_engine_hosts(&self, addrs: &[String]) {
        let cloud_name = &self.cloud.controller.cloud;
        let Some(mut cloud_obj) = self.get_object("cloud", cloud_name).await else {
            warn!("unable to retrieve cloud {cloud_name}");
            return;
        };
        let additions = host_entries_to_add(&cloud_obj, addrs);
        if additions.is_empty() {
            info!("all engine hosts already registered");
            return;
        }
        let count = additions.len();
        let config = &mut cloud_obj["linuxserver_configuration"];
        if !config["hosts"].is_array() {
            config["hosts"] = json!([]);
        }
        if let Some(hosts) = config["hosts"].as_array_mut() {
            hosts.extend(additions);
        }
        self.put_object("cloud", &cloud_obj).await;
        info!("registered {count} engine hosts on cloud {cloud_name}");
    }

    /// Empty the cloud config's host list and wait for the engine list to
    /// drain before the instances are deleted
    async fn drain_engines(&self) {
        let cloud_name = &self.cloud.controller.cloud;
        let Some(mut cloud_obj) = self.get_object("cloud", cloud_name).await else {
            warn!("unable to retrieve cloud {cloud_name}");
            return;
        };
        let has_hosts = cloud_obj
            .pointer("/linuxserver_configuration/hosts")
            .and_then(Value::as_array)
            .map(|hosts| !hosts.is_empty())
            .unwrap_or(false);
        if !has_hosts {
            return;
        }
        cloud_obj["linuxserver_configuration"]["hosts"] = json!([]);
        self.put_object("cloud", &cloud_obj).await;
        wait_for_ready(
            || self.list_engines(),
            engine_is_ready,
            engine_key,
            0,
            &ReadinessConfig::default(),
        )
        .await;
    }

    pub async fn delete_engines(&self) {
        self.drain_engines().await;
        self.reconciler_for(&self.cloud.engine)
            .delete_group(&self.cloud.engine_prefix(), false)
            .await;
    }

    pub async fn delete_client(&self) {
        self.reconciler_for(&self.cloud.client)
            .delete_group(&self.cloud.client_prefix(), false)
            .await;
    }

    pub async fn delete_pool(&self) {
        self.reconciler_for(&self.cloud.pool)
            .delete_group(&self.cloud.pool_prefix(), false)
            .await;
    }

    /// Configure the controller for linux-server engines: runtime
    /// properties, placement network, IPAM profile, connector user, the
    /// cloud config itself, and engine-group sizing.
    pub async fn create_cloud(&self) {
        let controller = &self.cloud.controller;

        // Engine runtime properties are a singleton object
        if let Some(properties) = self.get_singleton("seproperties").await {
            let mut properties = properties;
            properties["se_runtime_properties"]["se_handle_interface_routes"] = json!(true);
            properties["se_runtime_properties"]["global_mtu"] = json!(1400);
            self.put_object("seproperties", &properties).await;
        }

        let (prefix, mask) = subnet_parts(&controller.ipam_subnet);
        let network_body = json!({
            "name": controller.network,
            "configured_subnets": [{
                "prefix": {"ip_addr": {"addr": prefix, "type": "V4"}, "mask": mask},
                "static_ranges": [{
                    "begin": {"addr": controller.ipam_start, "type": "V4"},
                    "end": {"addr": controller.ipam_start, "type": "V4"},
                }],
            }],
        });
        let Some(network) = self.ensure_object("network", &controller.network, network_body).await
        else {
            return;
        };

        let ipam_body = json!({
            "name": controller.ipam_profile,
            "type": "IPAMDNS_TYPE_GCP",
            "gcp_profile": {"usable_network_refs": [network["url"]]},
        });
        let Some(ipam) = self
            .ensure_object("ipamdnsproviderprofile", &controller.ipam_profile, ipam_body)
            .await
        else {
            return;
        };

        let user_body = json!({
            "name": self.cloud.ssh_username,
            "public_key": self.cloud.ssh_public_key,
            "private_key": self.cloud.ssh_private_key,
        });
        if self
            .ensure_object("cloudconnectoruser", &self.cloud.ssh_username, user_body)
            .await
            .is_none()
        {
            return;
        }

        let ssh_attr = json!({"ssh_user": self.cloud.ssh_username});
        let cloud_obj = match self.get_object("cloud", &controller.cloud).await {
            None => {
                let body = json!({
                    "name": controller.cloud,
                    "vtype": "CLOUD_LINUXSERVER",
                    "ipam_provider_ref": ipam["url"],
                    "linuxserver_configuration": {"ssh_attr": ssh_attr},
                });
                self.ensure_object("cloud", &controller.cloud, body).await
            }
            Some(mut existing) => {
                existing["vtype"] = json!("CLOUD_LINUXSERVER");
                existing["ipam_provider_ref"] = ipam["url"].clone();
                if existing.get("linuxserver_configuration").is_none() {
                    existing["linuxserver_configuration"] = json!({});
                }
                existing["linuxserver_configuration"]["ssh_attr"] = ssh_attr;
                self.put_object("cloud", &existing).await;
                Some(existing)
            }
        };
        let Some(cloud_obj) = cloud_obj else { return };

        self.size_engine_group(&cloud_obj).await;
    }

    /// Pin the engine group serving this cloud to the configured scaleout
    async fn size_engine_group(&self, cloud_obj: &Value) {
        let cloud_uuid = cloud_obj.get("uuid").and_then(Value::as_str).unwrap_or_default();
        let groups = match self.control_plane.get_list("serviceenginegroup").await {
            Ok(response) if response.is_success() => response
                .body
                .get("results")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            Ok(response) => {
                warn!("serviceenginegroup list returned {}", response.status);
                return;
            }
            Err(err) => {
                warn!("error listing engine groups: {err}");
                return;
            }
        };
        let Some(mut group) = groups
            .into_iter()
            .find(|group| {
                group
                    .get("cloud_ref")
                    .and_then(Value::as_str)
                    .map(|cloud_ref| cloud_ref.contains(cloud_uuid))
                    .unwrap_or(false)
            })
        else {
            warn!("unable to find engine group for cloud {cloud_uuid}");
            return;
        };
        group["min_scaleout_per_vs"] = json!(self.cloud.engine.instances);
        group["max_scaleout_per_vs"] = json!(self.cloud.engine.instances);
        group["dedicated_dispatcher_core"] = json!(true);
        self.put_object("serviceenginegroup", &group).await;
    }

    /// Upsert datascript, pool (members from the pool group's addresses),
    /// and the virtual service in front of them
    pub async fn create_virtual_service(&self) {
        let controller = &self.cloud.controller;
        let pool_template = &self.cloud.pool;
        let pool_instances = filter_running(
            &self.reconciler_for(pool_template).list_running().await,
            &self.cloud.pool_prefix(),
        );
        if pool_instances.len() < pool_template.instances {
            warn!(
                "just {} pool instances running, {} requested",
                pool_instances.len(),
                pool_template.instances
            );
            return;
        }
        let pool_addrs = addresses(&pool_instances);

        let Some(datascript) = self
            .upsert_object(
                "vsdatascriptset",
                &controller.datascript,
                datascript_body(&controller.datascript),
            )
            .await
        else {
            return;
        };

        let Some(pool) = self
            .upsert_object(
                "pool",
                &pool_template.pool_name,
                pool_body(&pool_template.pool_name, &pool_addrs),
            )
            .await
        else {
            return;
        };

        let ssl_ref = match &controller.ssl_cert {
            None => None,
            Some(cert_name) => {
                let Some(cert) = self.get_object("sslkeyandcertificate", cert_name).await else {
                    warn!("ssl cert {cert_name} not found");
                    return;
                };
                Some(cert["url"].clone())
            }
        };

        let (placement_prefix, placement_mask) = subnet_parts(&controller.placement_subnet);
        let mut vs_body = json!({
            "name": controller.virtualservice,
            "ip_address": {"addr": controller.vip, "type": "V4"},
            "services": [{"port": controller.port, "enable_ssl": ssl_ref.is_some()}],
            "analytics_policy": {
                "client_insights": "NO_INSIGHTS",
                "metrics_realtime_update": {"duration": 0, "enabled": true},
                "full_client_logs": {"duration": 0, "enabled": false},
            },
            "scaleout_ecmp": true,
            "vs_datascripts": [{"index": 1, "vs_datascript_set_ref": datascript["url"]}],
            "pool_ref": pool["url"],
            "subnet": {
                "ip_addr": {"addr": placement_prefix, "type": "V4"},
                "mask": placement_mask,
            },
            "ign_pool_net_reach": true,
        });
        if let Some(ssl_ref) = ssl_ref {
            vs_body["ssl_key_and_certificate_refs"] = json!([ssl_ref]);
        }
        self.upsert_object("virtualservice", &controller.virtualservice, vs_body)
            .await;
    }

    pub async fn delete_virtual_service(&self) {
        let controller = &self.cloud.controller;
        for (object_type, name) in [
            ("virtualservice", controller.virtualservice.as_str()),
            ("pool", self.cloud.pool.pool_name.as_str()),
            ("vsdatascriptset", controller.datascript.as_str()),
        ] {
            match self.control_plane.delete_by_name(object_type, name).await {
                Ok(response) => info!("delete {object_type}/{name} returned {}", response.status),
                Err(err) => warn!("error deleting {object_type}/{name}: {err}"),
            }
        }
    }

    /// Detach the cloud config from this tool's objects and delete them
    pub async fn delete_cloud(&self) {
        let controller = &self.cloud.controller;
        self.drain_engines().await;
        if let Some(mut cloud_obj) = self.get_object("cloud", &controller.cloud).await {
            cloud_obj["vtype"] = json!("CLOUD_NONE");
            if let Some(obj) = cloud_obj.as_object_mut() {
                obj.remove("ipam_provider_ref");
                obj.remove("linuxserver_configuration");
            }
            self.put_object("cloud", &cloud_obj).await;
        }
        for (object_type, name) in [
            ("ipamdnsproviderprofile", controller.ipam_profile.as_str()),
            ("network", controller.network.as_str()),
            ("cloudconnectoruser", self.cloud.ssh_username.as_str()),
        ] {
            match self.control_plane.delete_by_name(object_type, name).await {
                Ok(response) => info!("delete {object_type}/{name} returned {}", response.status),
                Err(err) => warn!("error deleting {object_type}/{name}: {err}"),
            }
        }
    }

    /// Kick off the load generators against the virtual service
    pub async fn start_test(&self) {
        let template = &self.cloud.client;
        let prefix = self.cloud.client_prefix();
        let clients = filter_running(
            &self.reconciler_for(template).list_running().await,
            &prefix,
        );
        if clients.len() < template.instances {
            warn!(
                "just {} client instances running, {} requested",
                clients.len(),
                template.instances
            );
        }
        self.runner
            .run(
                &RemoteTask::StartLoad {
                    vip: self.cloud.controller.vip.clone(),
                    fanout: template.client_threads,
                },
                &addresses(&clients),
            )
            .await;
    }

    pub async fn stop_test(&self) {
        let clients = filter_running(
            &self.reconciler_for(&self.cloud.client).list_running().await,
            &self.cloud.client_prefix(),
        );
        self.runner
            .run(&RemoteTask::StopLoad, &addresses(&clients))
            .await;
    }

    pub async fn create_all(&self) {
        self.create_cloud().await;
        self.create_pool().await;
        self.create_engines().await;
        self.create_virtual_service().await;
        self.create_client().await;
    }

    pub async fn delete_all(&self) {
        self.delete_client().await;
        self.delete_virtual_service().await;
        self.delete_pool().await;
        self.delete_engines().await;
        self.delete_cloud().await;
    }

    // ------------------------------------------------------------------
    // Control-plane helpers
    // ------------------------------------------------------------------

    async fn get_object(&self, object_type: &str, name: &str) -> Option<Value> {
        match self.control_plane.get_object_by_name(object_type, name).await {
            Ok(object) => object,
            Err(err) => {
                warn!("error fetching {object_type}/{name}: {err}");
                None
            }
        }
    }

    /// Singleton objects come back as the sole entry of their list endpoint
    async fn get_singleton(&self, object_type: &str) -> Option<Value> {
        match self.control_plane.get_list(object_type).await {
            Ok(response) if response.is_success() => {
                if response.body.get("uuid").is_some() {
                    Some(response.body)
                } else {
                    response
                        .body
                        .get("results")
                        .and_then(Value::as_array)
                        .and_then(|results| results.first())
                        .cloned()
                }
            }
            Ok(response) => {
                warn!("{object_type} returned {}", response.status);
                None
            }
            Err(err) => {
                warn!("error fetching {object_type}: {err}");
                None
            }
        }
    }

    /// PUT an object back to `type/<uuid>`
    async fn put_object(&self, object_type: &str, object: &Value) {
        let Some(uuid) = object.get("uuid").and_then(Value::as_str) else {
            warn!("{object_type} object has no uuid, skipping update");
            return;
        };
        match self
            .control_plane
            .put_path(&format!("{object_type}/{uuid}"), object)
            .await
        {
            Ok(response) => info!("updated {object_type}/{uuid} status {}", response.status),
            Err(err) => warn!("error updating {object_type}/{uuid}: {err}"),
        }
    }

    /// Create the object if absent, then return the stored version
    async fn ensure_object(&self, object_type: &str, name: &str, body: Value) -> Option<Value> {
        if let Some(existing) = self.get_object(object_type, name).await {
            return Some(existing);
        }
        match self.control_plane.post_object(object_type, &body).await {
            Ok(response) if response.is_success() => {
                info!("created {object_type} {name}");
            }
            Ok(response) => {
                warn!("error creating {object_type} {name}: status {}", response.status);
                return None;
            }
            Err(err) => {
                warn!("error creating {object_type} {name}: {err}");
                return None;
            }
        }
        self.get_object(object_type, name).await
    }

    /// Create or overwrite the object with `body`, returning the stored
    /// version (the upserted fields plus controller-assigned uuid/url)
    async fn upsert_object(&self, object_type: &str, name: &str, body: Value) -> Option<Value> {
        match self.get_object(object_type, name).await {
            None => {
                match self.control_plane.post_object(object_type, &body).await {
                    Ok(response) if response.is_success() => info!("created {object_type} {name}"),
                    Ok(response) => {
                        warn!(
                            "error creating {object_type} {name}: status {}",
                            response.status
                        );
                        return None;
                    }
                    Err(err) => {
                        warn!("error creating {object_type} {name}: {err}");
                        return None;
                    }
                }
            }
            Some(mut existing) => {
                if let (Some(existing_map), Some(body_map)) =
                    (existing.as_object_mut(), body.as_object())
                {
                    for (key, value) in body_map {
                        existing_map.insert(key.clone(), value.clone());
                    }
                }
                self.put_object(object_type, &existing).await;
            }
        }
        self.get_object(object_type, name).await
    }
}

fn filter_running(records: &[InstanceRecord], prefix: &str) -> Vec<InstanceRecord> {
    crate::fleet::filter_by_prefix(records, prefix)
}
