//! cookbridge demo - Main Entry Point
//!
//! Drives the cook scheduler against the in-process simulated engine: a
//! sphere feeding a subdivide node, a parameter edit, and a clean shutdown.
//! Host messages are printed as they arrive.

use cookbridge::engine::mock::{MockOperator, MockPart};
use cookbridge::node::input::InputSource;
use cookbridge::{
    CookBackend, CookRequest, EngineSettings, HostHandle, HostMessage, MockEngine, NodeKey,
    ParmValue, RecordingScene,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEMO_LIBRARY: &str = "/demo/shapes.lib";

fn main() -> anyhow::Result<()> {
    let settings = EngineSettings::load_or_default();

    // Initialize logging; the guard flushes the file writer on exit
    let (file_layer, _guard) = match &settings.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "cookbridge.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,cookbridge=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    tracing::info!("Starting cookbridge demo");

    let engine = MockEngine::new()
        .with_call_delay(Duration::from_millis(20))
        .with_library_file(
            DEMO_LIBRARY,
            vec![
                MockOperator::new("Sop/sphere")
                    .parm("radius", ParmValue::Float(1.0))
                    .parts(vec![MockPart::mesh("sphere")]),
                MockOperator::new("Sop/subdivide")
                    .parm("iterations", ParmValue::Int(1))
                    .geo_inputs(1)
                    .parts(vec![MockPart::mesh("subdivided")]),
            ],
        );

    let (backend, handle) = CookBackend::new(
        Arc::new(engine),
        settings,
        Box::new(RecordingScene::new()),
    )?;
    let backend_thread = std::thread::spawn(move || backend.run());

    handle.register_asset("shapes", Some(DEMO_LIBRARY.into()), Vec::new());
    handle.register_node("ball", "shapes", Some("Sop/sphere"));
    handle.register_node("smooth", "shapes", Some("Sop/subdivide"));
    handle.request_cook("ball", CookRequest::Requested);
    pump(&handle, Duration::from_secs(2));

    handle.request_cook("smooth", CookRequest::Requested);
    pump(&handle, Duration::from_secs(2));

    // Keys are handed out in registration order
    handle.bind_input("smooth", "input0", InputSource::Node(NodeKey(0)));
    handle.set_parameter("ball", "radius", ParmValue::Float(2.5));
    pump(&handle, Duration::from_secs(2));

    tracing::info!("Shutting down...");
    handle.shutdown();
    pump(&handle, Duration::from_secs(2));
    if backend_thread.join().is_err() {
        anyhow::bail!("scheduler thread panicked");
    }
    Ok(())
}

/// Print host messages until `window` passes or the scheduler exits
fn pump(handle: &HostHandle, window: Duration) {
    let deadline = Instant::now() + window;
    while Instant::now() < deadline {
        match handle.receiver.recv_timeout(Duration::from_millis(50)) {
            Ok(HostMessage::Shutdown) => {
                println!("scheduler: shutdown");
                return;
            }
            Ok(msg) => println!("scheduler: {:?}", msg),
            Err(_) => continue,
        }
    }
}
