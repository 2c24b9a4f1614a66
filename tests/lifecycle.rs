//! Lifecycle tests of the manager and registry over a mock provisioner.

mod common;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use burlap::context::ClientContext;
use burlap::kernelspec::{KernelInterruptMode, KernelSpec, KernelSpecResolver};
use burlap::manager::{KernelManager, LifecycleState, ManagerConfig};
use burlap::multikernel::MultiKernelManager;
use burlap::wire_protocol::Reply;
use burlap::Error;
use common::{wait_until, write_spec, MockKernelControl, MockProvisioner};

const SHORT: Duration = Duration::from_secs(5);

fn fake_spec(interrupt_mode: KernelInterruptMode) -> KernelSpec {
    KernelSpec {
        argv: vec!["fake-kernel".into(), "-f".into(), "{connection_file}".into()],
        display_name: "Fake".into(),
        language: "fake".into(),
        interrupt_mode,
        env: BTreeMap::new(),
        metadata: serde_json::Map::new(),
    }
}

fn test_context(control: &Arc<MockKernelControl>) -> ClientContext {
    let context = ClientContext::with_resolver(KernelSpecResolver::with_paths(vec![]));
    let control = control.clone();
    context
        .provisioners()
        .register("mock", move || Box::new(MockProvisioner::new(control.clone())));
    context
}

fn mock_config() -> ManagerConfig {
    ManagerConfig {
        provisioner: "mock".into(),
        ephemeral: true,
        startup_timeout: Duration::from_secs(10),
        shutdown_timeout: Duration::from_secs(2),
        restart_timeout: Duration::from_secs(2),
        ..ManagerConfig::default()
    }
}

#[tokio::test]
async fn start_shutdown_and_start_again() {
    let control = MockKernelControl::new();
    let context = test_context(&control);
    let manager = KernelManager::new(
        "fake",
        fake_spec(KernelInterruptMode::Signal),
        None,
        mock_config(),
        &context,
    )
    .unwrap();
    assert_eq!(manager.state(), LifecycleState::Unstarted);

    manager.start_kernel().await.unwrap();
    assert_eq!(manager.state(), LifecycleState::Running);
    assert!(manager.is_alive().await);

    let client = manager.client().unwrap();
    let reply = client.kernel_info(SHORT).await.unwrap();
    assert!(matches!(reply.content, Reply::Ok(_)));

    let connection = manager.connection_info().unwrap();
    manager.shutdown_kernel(false).await.unwrap();
    assert_eq!(manager.state(), LifecycleState::Dead);
    assert!(!manager.is_alive().await);
    assert!(manager.client().is_none());

    // Once dead, nothing but start_kernel brings the kernel back.
    assert!(matches!(
        manager.restart_kernel(false).await,
        Err(Error::NotRunning(_))
    ));

    // A fresh start reuses the same connection descriptor.
    manager.start_kernel().await.unwrap();
    assert_eq!(manager.state(), LifecycleState::Running);
    assert_eq!(manager.connection_info().unwrap(), connection);
    assert_eq!(control.launches(), 2);

    manager.shutdown_kernel(true).await.unwrap();
    assert_eq!(manager.state(), LifecycleState::Dead);
}

#[tokio::test]
async fn state_transitions_are_published() {
    let control = MockKernelControl::new();
    let context = test_context(&control);
    let manager = KernelManager::new(
        "fake",
        fake_spec(KernelInterruptMode::Signal),
        None,
        mock_config(),
        &context,
    )
    .unwrap();

    let mut listener = manager.state_listener();
    let states = Arc::new(Mutex::new(vec![*listener.borrow()]));
    let recorded = states.clone();
    tokio::spawn(async move {
        while listener.changed().await.is_ok() {
            recorded.lock().unwrap().push(*listener.borrow());
        }
    });

    manager.start_kernel().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.shutdown_kernel(false).await.unwrap();

    assert!(
        wait_until(SHORT, {
            let states = states.clone();
            move || states.lock().unwrap().contains(&LifecycleState::Dead)
        })
        .await
    );

    // Transitions appear in lifecycle order.
    let states = states.lock().unwrap().clone();
    let order: Vec<usize> = [
        LifecycleState::Running,
        LifecycleState::ShuttingDown,
        LifecycleState::Dead,
    ]
    .iter()
    .map(|state| states.iter().position(|seen| seen == state).unwrap())
    .collect();
    assert!(order.windows(2).all(|pair| pair[0] < pair[1]), "{states:?}");
}

#[tokio::test]
async fn interrupts_require_a_running_kernel() {
    let control = MockKernelControl::new();
    let context = test_context(&control);
    let manager = KernelManager::new(
        "fake",
        fake_spec(KernelInterruptMode::Message),
        None,
        mock_config(),
        &context,
    )
    .unwrap();

    assert!(matches!(
        manager.interrupt_kernel().await,
        Err(Error::NotRunning(_))
    ));

    manager.start_kernel().await.unwrap();
    // Message mode goes over the control channel; the fake kernel replies.
    manager.interrupt_kernel().await.unwrap();
    assert_eq!(manager.state(), LifecycleState::Running);

    manager.shutdown_kernel(false).await.unwrap();
    assert!(matches!(
        manager.interrupt_kernel().await,
        Err(Error::NotRunning(_))
    ));
}

#[tokio::test]
async fn signal_mode_interrupts_go_through_the_provisioner() {
    let control = MockKernelControl::new();
    let context = test_context(&control);
    let manager = KernelManager::new(
        "fake",
        fake_spec(KernelInterruptMode::Signal),
        None,
        mock_config(),
        &context,
    )
    .unwrap();

    manager.start_kernel().await.unwrap();
    manager.interrupt_kernel().await.unwrap();
    assert_eq!(manager.state(), LifecycleState::Running);
    manager.shutdown_kernel(false).await.unwrap();
}

#[tokio::test]
async fn restart_relaunches_on_the_same_connection() {
    let control = MockKernelControl::new();
    let context = test_context(&control);
    let manager = KernelManager::new(
        "fake",
        fake_spec(KernelInterruptMode::Signal),
        None,
        mock_config(),
        &context,
    )
    .unwrap();

    manager.start_kernel().await.unwrap();
    let connection = manager.connection_info().unwrap();

    manager.restart_kernel(false).await.unwrap();
    assert_eq!(manager.state(), LifecycleState::Running);
    assert_eq!(control.launches(), 2);
    assert_eq!(manager.connection_info().unwrap(), connection);

    // The relaunched kernel answers on the same ports.
    let client = manager.client().unwrap();
    let reply = client.kernel_info(SHORT).await.unwrap();
    assert!(matches!(reply.content, Reply::Ok(_)));

    manager.shutdown_kernel(false).await.unwrap();
}

#[tokio::test]
async fn starting_twice_fails() {
    let control = MockKernelControl::new();
    let context = test_context(&control);
    let manager = KernelManager::new(
        "fake",
        fake_spec(KernelInterruptMode::Signal),
        None,
        mock_config(),
        &context,
    )
    .unwrap();

    manager.start_kernel().await.unwrap();
    assert!(matches!(
        manager.start_kernel().await,
        Err(Error::StartFailed(_))
    ));
    manager.shutdown_kernel(false).await.unwrap();
}

#[tokio::test]
async fn autorestart_relaunches_until_the_limit() {
    let control = MockKernelControl::new();
    let context = test_context(&control);
    let manager = KernelManager::new(
        "fake",
        fake_spec(KernelInterruptMode::Signal),
        None,
        ManagerConfig {
            autorestart: true,
            max_restarts: 2,
            // Never reset the consecutive-restart counter.
            stable_after: Duration::from_secs(3600),
            ..mock_config()
        },
        &context,
    )
    .unwrap();

    manager.start_kernel().await.unwrap();
    assert_eq!(control.launches(), 1);

    control.crash();
    assert!(
        wait_until(Duration::from_secs(15), {
            let manager = manager.clone();
            let control = control.clone();
            move || control.launches() == 2 && manager.state() == LifecycleState::Running
        })
        .await,
        "first automatic restart did not happen"
    );

    control.crash();
    assert!(
        wait_until(Duration::from_secs(15), {
            let manager = manager.clone();
            let control = control.clone();
            move || control.launches() == 3 && manager.state() == LifecycleState::Running
        })
        .await,
        "second automatic restart did not happen"
    );

    // The third death exceeds the limit: no relaunch, kernel stays dead.
    control.crash();
    assert!(
        wait_until(Duration::from_secs(15), {
            let manager = manager.clone();
            move || manager.state() == LifecycleState::Dead
        })
        .await
    );
    assert_eq!(control.launches(), 3);
}

#[tokio::test]
async fn unknown_provisioners_are_rejected() {
    let control = MockKernelControl::new();
    let context = test_context(&control);
    let result = KernelManager::new(
        "fake",
        fake_spec(KernelInterruptMode::Signal),
        None,
        ManagerConfig {
            provisioner: "warp".into(),
            ..mock_config()
        },
        &context,
    );
    assert!(matches!(result, Err(Error::UnknownProvisioner(name)) if name == "warp"));
}

#[tokio::test]
async fn multikernel_registry_isolates_kernels() {
    let control = MockKernelControl::new();
    let dir = tempfile::tempdir().unwrap();
    write_spec(dir.path(), "fake").await;

    let context = ClientContext::with_resolver(KernelSpecResolver::with_paths(vec![dir
        .path()
        .to_path_buf()]));
    {
        let control = control.clone();
        context
            .provisioners()
            .register("mock", move || Box::new(MockProvisioner::new(control.clone())));
    }
    let registry = MultiKernelManager::new(Arc::new(context));

    let first = registry.start_kernel("fake", mock_config()).await.unwrap();
    let second = registry.start_kernel("fake", mock_config()).await.unwrap();
    assert_ne!(first, second);
    assert_eq!(registry.list_ids().len(), 2);
    assert_eq!(control.launches(), 2);

    assert_eq!(
        registry.get(&first).unwrap().state(),
        LifecycleState::Running
    );
    assert!(matches!(
        registry.get("nope"),
        Err(Error::NoSuchKernel(_))
    ));
    assert!(matches!(
        registry.start_kernel("missing", mock_config()).await,
        Err(Error::NoSuchKernel(_))
    ));

    registry.restart(&first).await.unwrap();
    assert_eq!(control.launches(), 3);

    let failures = registry.shutdown_all(Duration::from_secs(10)).await;
    assert!(failures.is_empty(), "{failures:?}");
    assert!(registry.list_ids().is_empty());
}
