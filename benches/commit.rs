use criterion::{criterion_group, criterion_main, Criterion};
use drm::control::{from_u32, property};

use atomic_kms::{
    backend::drm::{
        device::test::{preferred_mode, TestDevice},
        AtomicCommit, DrmBackend, ObjectId, OutputConfiguration, OutputId,
    },
    config::DrmBackendConfig,
};

fn build_commit(c: &mut Criterion) {
    let crtc = ObjectId::Crtc(from_u32(40).unwrap());
    let plane = ObjectId::Plane(from_u32(41).unwrap());
    let props: Vec<property::Handle> = (100..110).map(|raw| from_u32(raw).unwrap()).collect();

    c.bench_function("build_commit", |b| {
        b.iter(|| {
            let mut commit = AtomicCommit::new();
            commit.add_property(crtc, props[0], "ACTIVE", 1);
            commit.add_property(crtc, props[1], "MODE_ID", 7);
            for (i, name) in ["FB_ID", "CRTC_ID", "SRC_W", "SRC_H", "CRTC_W", "CRTC_H"]
                .into_iter()
                .enumerate()
            {
                commit.add_property(plane, props[i + 2], name, i as u64);
            }
            commit.set_modeset();
            commit.to_request()
        })
    });
}

fn present_frame(c: &mut Criterion) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let (device, out) = TestDevice::single_output("DP-1", vec![preferred_mode(1920, 1080, 60)]);
    let (mut backend, _events) = DrmBackend::new(DrmBackendConfig::default());
    let gpu = backend.add_gpu(device.clone()).unwrap();
    let id = OutputId {
        gpu,
        connector: out.connector,
    };
    backend
        .apply_output_configuration(&[(id, OutputConfiguration::default())])
        .unwrap();
    backend.dispatch_device_events(gpu).unwrap();

    c.bench_function("present_frame", |b| {
        b.iter(|| {
            let target = backend.begin_frame(id).unwrap();
            backend.present(id).unwrap();
            backend.dispatch_device_events(gpu).unwrap();
            device.clear_commits();
            target
        })
    });
}

criterion_group!(benches, build_commit, present_frame);
criterion_main!(benches);
