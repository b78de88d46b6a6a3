use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use dashmap::DashSet;
use log::{debug, info};

use crate::api::{Uid, VirtualMachineInstance};
use crate::domain::Domain;
use crate::network::domainspec::{GeneratorDeps, generator_for};
use crate::network::istio::SidecarPolicy;
use crate::network::link::LinkLookup;

/// Network work performed inside the pod network namespace.
pub trait PodNetworkConfigurator: Sync {
    fn setup_pod_network(&self, vmi: &VirtualMachineInstance, launcher_pid: i32) -> Result<()>;
}

/// Runs pod network setup at most once per VM instance.
///
/// Completion is recorded per instance UID only after the whole setup
/// succeeds, so a failed attempt can be retried. Two concurrent calls for
/// the same instance may both run the setup before either records it.
pub struct Controller<C> {
    setup_completed: DashSet<Uid>,
    configurator: C,
}

impl<C: PodNetworkConfigurator> Controller<C> {
    pub fn new(configurator: C) -> Self {
        Self {
            setup_completed: DashSet::new(),
            configurator,
        }
    }

    /// Applies the (privileged) network changes for an existing launcher
    /// pod. `do_net_ns` receives the configuration step and must run it in
    /// the network namespace of `launcher_pid`.
    pub fn setup<N, P>(
        &self,
        vmi: &VirtualMachineInstance,
        launcher_pid: i32,
        do_net_ns: N,
        pre_setup: P,
    ) -> Result<()>
    where
        N: FnOnce(&(dyn Fn() -> Result<()> + Sync)) -> Result<()>,
        P: FnOnce() -> Result<()>,
    {
        let id = vmi.uid();
        if self.setup_completed.contains(id) {
            debug!("Network setup for {} already completed", id);
            return Ok(());
        }

        pre_setup().context("setup failed")?;

        let configurator = &self.configurator;
        do_net_ns(&|| configurator.setup_pod_network(vmi, launcher_pid)).context("setup failed")?;

        self.setup_completed.insert(id.clone());
        info!("Network setup for {} completed", id);

        Ok(())
    }

    pub fn teardown<F>(&self, vmi: &VirtualMachineInstance, teardown: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        self.setup_completed.remove(vmi.uid());
        info!("Tearing down network of {}", vmi.uid());
        teardown().context("teardown failed")
    }

    pub fn is_setup_completed(&self, vmi: &VirtualMachineInstance) -> bool {
        self.setup_completed.contains(vmi.uid())
    }
}

/// Renders every bound VM interface into the shared domain document.
///
/// `links` is called inside the pod network namespace to open the link
/// lookup there.
pub struct VmNetworkConfigurator<F> {
    domain: Arc<Mutex<Domain>>,
    pod_ifaces: HashMap<String, String>,
    sidecar: Arc<dyn SidecarPolicy>,
    passt_log_file: String,
    links: F,
}

impl<F> VmNetworkConfigurator<F>
where
    F: Fn() -> Result<Box<dyn LinkLookup>> + Sync,
{
    pub fn new(
        domain: Arc<Mutex<Domain>>,
        pod_ifaces: HashMap<String, String>,
        sidecar: Arc<dyn SidecarPolicy>,
        passt_log_file: String,
        links: F,
    ) -> Self {
        Self {
            domain,
            pod_ifaces,
            sidecar,
            passt_log_file,
            links,
        }
    }
}

impl<F> PodNetworkConfigurator for VmNetworkConfigurator<F>
where
    F: Fn() -> Result<Box<dyn LinkLookup>> + Sync,
{
    fn setup_pod_network(&self, vmi: &VirtualMachineInstance, launcher_pid: i32) -> Result<()> {
        debug!(
            "Generating domain interfaces of {} in the network namespace of pid {}",
            vmi.uid(),
            launcher_pid
        );
        let links = (self.links)()?;
        let mut domain = self
            .domain
            .lock()
            .map_err(|_| anyhow!("domain lock poisoned"))?;
        let deps = GeneratorDeps {
            vmi,
            links: links.as_ref(),
            sidecar: self.sidecar.as_ref(),
            passt_log_file: &self.passt_log_file,
        };
        for iface in vmi.interfaces() {
            let Some(pod_iface) = self.pod_ifaces.get(&iface.name) else {
                debug!("No pod interface bound to {}, skipping", iface.name);
                continue;
            };
            if let Some(mut generator) = generator_for(deps, iface, pod_iface, &mut domain) {
                generator
                    .generate()
                    .with_context(|| format!("failed to generate interface {}", iface.name))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crossbeam::sync::WaitGroup;
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};

    use super::*;
    use crate::api::{Interface, InterfaceBridge, InterfacePasst, InterfaceSriov, Port};
    use crate::constants::FILE_PASST_LOG;
    use crate::domain::{
        Alias, Devices, Interface as DomainInterface, InterfacePortForward, PortForwardRange,
        Protocol,
    };
    use crate::network::istio::Istio;
    use crate::network::link::fake::FakeLinks;

    #[derive(Default)]
    struct CountingConfigurator {
        calls: AtomicUsize,
        fail: bool,
    }

    impl PodNetworkConfigurator for CountingConfigurator {
        fn setup_pod_network(&self, _vmi: &VirtualMachineInstance, _pid: i32) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("unable to enter namespace"));
            }
            Ok(())
        }
    }

    fn vmi(uid: &str) -> VirtualMachineInstance {
        let mut vmi = VirtualMachineInstance::default();
        vmi.metadata.name = "testvmi".into();
        vmi.metadata.uid = Uid::new(uid);
        vmi
    }

    fn in_place(f: &(dyn Fn() -> Result<()> + Sync)) -> Result<()> {
        f()
    }

    #[test]
    fn test_setup_completed_lifecycle() {
        let controller = Controller::new(CountingConfigurator::default());
        let vmi = vmi("123");

        assert!(!controller.is_setup_completed(&vmi));
        controller.setup(&vmi, 1, in_place, || Ok(())).unwrap();
        assert!(controller.is_setup_completed(&vmi));
        controller.teardown(&vmi, || Ok(())).unwrap();
        assert!(!controller.is_setup_completed(&vmi));
    }

    #[test]
    fn test_setup_runs_once() {
        let controller = Controller::new(CountingConfigurator::default());
        let vmi = vmi("123");
        let runner_calls = AtomicUsize::new(0);
        let pre_setup_calls = AtomicUsize::new(0);

        for _ in 0..3 {
            controller
                .setup(
                    &vmi,
                    1,
                    |f| {
                        runner_calls.fetch_add(1, Ordering::SeqCst);
                        f()
                    },
                    || {
                        pre_setup_calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    },
                )
                .unwrap();
        }

        assert_eq!(1, runner_calls.load(Ordering::SeqCst));
        assert_eq!(1, pre_setup_calls.load(Ordering::SeqCst));
        assert_eq!(1, controller.configurator.calls.load(Ordering::SeqCst));
    }

    #[test]
    fn test_setup_runs_again_after_teardown() {
        let controller = Controller::new(CountingConfigurator::default());
        let vmi = vmi("123");

        controller.setup(&vmi, 1, in_place, || Ok(())).unwrap();
        controller.teardown(&vmi, || Ok(())).unwrap();
        controller.setup(&vmi, 1, in_place, || Ok(())).unwrap();

        assert_eq!(2, controller.configurator.calls.load(Ordering::SeqCst));
    }

    #[test]
    fn test_setup_pre_setup_failure() {
        let controller = Controller::new(CountingConfigurator::default());
        let vmi = vmi("123");
        let runner_calls = AtomicUsize::new(0);

        let err = controller
            .setup(
                &vmi,
                1,
                |f| {
                    runner_calls.fetch_add(1, Ordering::SeqCst);
                    f()
                },
                || Err(anyhow!("unable to create tap device")),
            )
            .unwrap_err();

        assert_eq!("setup failed", err.to_string());
        assert_eq!(
            "setup failed: unable to create tap device",
            format!("{:#}", err)
        );
        assert_eq!(0, runner_calls.load(Ordering::SeqCst));
        assert!(!controller.is_setup_completed(&vmi));
    }

    #[test]
    fn test_setup_namespace_failure_is_retryable() {
        let controller = Controller::new(CountingConfigurator {
            fail: true,
            ..Default::default()
        });
        let vmi = vmi("123");

        let err = controller.setup(&vmi, 1, in_place, || Ok(())).unwrap_err();
        assert_eq!(
            "setup failed: unable to enter namespace",
            format!("{:#}", err)
        );
        assert!(!controller.is_setup_completed(&vmi));

        let err = controller
            .setup(&vmi, 1, |_| Err(anyhow!("setns failed")), || Ok(()))
            .unwrap_err();
        assert_eq!("setup failed: setns failed", format!("{:#}", err));
        assert!(!controller.is_setup_completed(&vmi));

        // Retried calls reach the namespace step again.
        assert_eq!(1, controller.configurator.calls.load(Ordering::SeqCst));
    }

    #[test]
    fn test_teardown_failure_still_clears() {
        let controller = Controller::new(CountingConfigurator::default());
        let vmi = vmi("123");

        controller.setup(&vmi, 1, in_place, || Ok(())).unwrap();
        let err = controller
            .teardown(&vmi, || Err(anyhow!("unable to remove tap device")))
            .unwrap_err();

        assert_eq!(
            "teardown failed: unable to remove tap device",
            format!("{:#}", err)
        );
        assert!(!controller.is_setup_completed(&vmi));
    }

    #[test]
    fn test_teardown_without_setup() {
        let controller = Controller::new(CountingConfigurator::default());
        let vmi = vmi("123");
        let called = AtomicUsize::new(0);

        controller
            .teardown(&vmi, || {
                called.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        assert_eq!(1, called.load(Ordering::SeqCst));
        assert!(!controller.is_setup_completed(&vmi));
    }

    #[test]
    fn test_setup_concurrent_instances() {
        let controller = Controller::new(CountingConfigurator::default());
        let vmis: Vec<VirtualMachineInstance> =
            (0..8).map(|i| vmi(&format!("uid-{}", i))).collect();
        let wg = WaitGroup::new();

        crossbeam::scope(|s| {
            for vmi in &vmis {
                let wg = wg.clone();
                let controller = &controller;
                s.spawn(move |_| {
                    controller.setup(vmi, 1, in_place, || Ok(())).unwrap();
                    drop(wg);
                });
            }
        })
        .unwrap();
        wg.wait();

        for vmi in &vmis {
            assert!(controller.is_setup_completed(vmi));
        }
        assert_eq!(8, controller.configurator.calls.load(Ordering::SeqCst));

        controller.teardown(&vmis[0], || Ok(())).unwrap();
        assert!(!controller.is_setup_completed(&vmis[0]));
        for vmi in &vmis[1..] {
            assert!(controller.is_setup_completed(vmi));
        }
    }

    #[test]
    fn test_setup_concurrent_same_instance() {
        let controller = Controller::new(CountingConfigurator::default());
        let vmi = vmi("123");

        crossbeam::scope(|s| {
            for _ in 0..8 {
                s.spawn(|_| controller.setup(&vmi, 1, in_place, || Ok(())).unwrap());
            }
        })
        .unwrap();

        assert!(controller.is_setup_completed(&vmi));
        let calls = controller.configurator.calls.load(Ordering::SeqCst);
        assert!((1..=8).contains(&calls));

        // Once recorded, further calls are no-ops.
        controller.setup(&vmi, 1, in_place, || Ok(())).unwrap();
        assert_eq!(calls, controller.configurator.calls.load(Ordering::SeqCst));
    }

    fn configurator_vmi() -> VirtualMachineInstance {
        let mut vmi = vmi("456");
        vmi.spec.domain.devices.interfaces = vec![
            Interface {
                name: "default".into(),
                passt: Some(InterfacePasst {}),
                ports: vec![Port {
                    name: "http".into(),
                    protocol: "TCP".into(),
                    port: 8080,
                }],
                ..Default::default()
            },
            Interface {
                name: "blue".into(),
                bridge: Some(InterfaceBridge {}),
                ..Default::default()
            },
            Interface {
                name: "red".into(),
                sriov: Some(InterfaceSriov {}),
                ..Default::default()
            },
            Interface {
                name: "green".into(),
                bridge: Some(InterfaceBridge {}),
                ..Default::default()
            },
        ];
        vmi
    }

    fn configurator_domain() -> Domain {
        let iface = |alias: &str| DomainInterface {
            iface_type: "ethernet".into(),
            alias: Some(Alias::new_user_defined(alias)),
            ..Default::default()
        };
        Domain {
            name: "default_testvmi".into(),
            devices: Devices {
                interfaces: vec![iface("default"), iface("blue"), iface("red"), iface("green")],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn fake_links() -> Result<Box<dyn LinkLookup>> {
        Ok(Box::new(
            FakeLinks::default()
                .with_link("eth0", [0x0a, 0x58, 0x0a, 0xf4, 0x00, 0x07], 1400)
                .with_link("pod16477688c0e", [0x02, 0, 0, 0, 0, 0x02], 1500)
                .with_link("tap16477688c0e", [0x02, 0, 0, 0, 0, 0x03], 1500),
        ))
    }

    #[test]
    fn test_vm_network_configurator() {
        let domain = Arc::new(Mutex::new(configurator_domain()));
        let pod_ifaces = HashMap::from([
            ("default".to_string(), "eth0".to_string()),
            ("blue".to_string(), "pod16477688c0e".to_string()),
            ("red".to_string(), "net2".to_string()),
        ]);
        let configurator = VmNetworkConfigurator::new(
            domain.clone(),
            pod_ifaces,
            Arc::new(Istio::default()),
            FILE_PASST_LOG.into(),
            fake_links,
        );
        let controller = Controller::new(configurator);
        let vmi = configurator_vmi();

        controller.setup(&vmi, 42, in_place, || Ok(())).unwrap();

        let domain = domain.lock().unwrap();
        let passt = domain.interface_by_alias("default").unwrap();
        assert_eq!("user", passt.iface_type);
        assert_eq!("eth0", passt.source.device);
        assert_eq!(
            vec![InterfacePortForward {
                proto: Protocol::Tcp,
                ranges: vec![PortForwardRange::port(8080)],
            }],
            passt.port_forward
        );

        let tap = domain.interface_by_alias("blue").unwrap();
        assert_eq!("tap16477688c0e", tap.target.as_ref().unwrap().device);
        assert_eq!("02:00:00:00:00:02", tap.mac.as_ref().unwrap().address);
        assert_eq!("1500", tap.mtu.as_ref().unwrap().size);

        // SR-IOV has no generator and green has no pod interface bound.
        assert_eq!(
            &configurator_domain().devices.interfaces[2..],
            &domain.devices.interfaces[2..]
        );
    }

    #[test]
    fn test_vm_network_configurator_failure() {
        let mut broken = configurator_domain();
        broken.devices.interfaces.remove(0);
        let domain = Arc::new(Mutex::new(broken));
        let pod_ifaces = HashMap::from([("default".to_string(), "eth0".to_string())]);
        let configurator = VmNetworkConfigurator::new(
            domain,
            pod_ifaces,
            Arc::new(Istio::default()),
            FILE_PASST_LOG.into(),
            fake_links,
        );
        let controller = Controller::new(configurator);
        let vmi = configurator_vmi();

        let err = controller.setup(&vmi, 42, in_place, || Ok(())).unwrap_err();
        assert_eq!(
            "setup failed: failed to generate interface default: failed to find interface default in domain spec",
            format!("{:#}", err)
        );
        assert!(!controller.is_setup_completed(&vmi));
    }

    // Members the generators rewrite on an interface entry.
    const GENERATED_FIELDS: [&str; 7] = [
        "type",
        "source",
        "mac",
        "mtu",
        "target",
        "backend",
        "portForward",
    ];

    fn without_generated_fields(mut doc: Value) -> Value {
        if let Some(ifaces) = doc["devices"]["interfaces"].as_array_mut() {
            for iface in ifaces.iter_mut().filter_map(Value::as_object_mut) {
                for field in GENERATED_FIELDS {
                    iface.remove(field);
                }
            }
        }
        doc
    }

    #[test]
    fn test_vm_network_configurator_keeps_document_content() {
        let input = json!({
            "name": "default_testvmi",
            "uuid": "5a9fc181-957e-5c32-9e5a-2de5e9673531",
            "memory": {"value": 1024, "unit": "KiB"},
            "os": {"type": {"os": "hvm", "arch": "x86_64"}},
            "devices": {
                "emulator": "/usr/libexec/qemu-kvm",
                "disks": [{"device": "disk", "target": {"bus": "virtio", "device": "vda"}}],
                "interfaces": [
                    {
                        "type": "ethernet",
                        "alias": {"name": "ua-default"},
                        "model": {"type": "virtio-non-transitional"},
                        "address": {"type": "pci", "domain": "0x0000", "bus": "0x01"},
                        "rom": {"enabled": "no"}
                    },
                    {
                        "type": "ethernet",
                        "alias": {"name": "ua-blue"},
                        "driver": {"name": "vhost", "queues": "2"}
                    },
                    {
                        "type": "hostdev",
                        "alias": {"name": "ua-red"},
                        "source": {"address": {"type": "pci", "bus": "0x3b"}}
                    }
                ]
            }
        });
        let domain: Domain = serde_json::from_value(input.clone()).unwrap();
        let domain = Arc::new(Mutex::new(domain));
        let pod_ifaces = HashMap::from([
            ("default".to_string(), "eth0".to_string()),
            ("blue".to_string(), "pod16477688c0e".to_string()),
            ("red".to_string(), "net2".to_string()),
        ]);
        let configurator = VmNetworkConfigurator::new(
            domain.clone(),
            pod_ifaces,
            Arc::new(Istio::default()),
            FILE_PASST_LOG.into(),
            fake_links,
        );
        let controller = Controller::new(configurator);
        let mut vmi = configurator_vmi();
        vmi.spec.domain.devices.interfaces.truncate(3);

        controller.setup(&vmi, 42, in_place, || Ok(())).unwrap();

        let output = serde_json::to_value(&*domain.lock().unwrap()).unwrap();
        assert_eq!(
            without_generated_fields(input.clone()),
            without_generated_fields(output.clone())
        );

        let ifaces = &output["devices"]["interfaces"];
        assert_eq!(json!("user"), ifaces[0]["type"]);
        assert_eq!(json!({"device": "eth0"}), ifaces[0]["source"]);
        assert_eq!(json!({"enabled": "no"}), ifaces[0]["rom"]);
        assert_eq!(json!("tap16477688c0e"), ifaces[1]["target"]["device"]);
        assert_eq!(Value::Null, ifaces[1]["source"]);
        // No generator runs for SR-IOV, so the entry is written back as read.
        assert_eq!(input["devices"]["interfaces"][2], ifaces[2]);
    }
}
