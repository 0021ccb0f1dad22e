//! Edit-mode sessions on calculator kernel processes.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use nbsession::commands::Command;
use nbsession::config::RuntimeConfig;
use nbsession::consumer::ChannelConsumer;
use nbsession::kernel::{DefaultKernelLauncher, KernelError};
use nbsession::notifications::{CellStatus, Notification};
use nbsession::session::Session;
use nbsession::{KernelState, SessionError, SessionMode};
use serde_json::json;
use tempfile::TempDir;

use common::*;

fn is_running(cell_id: &str) -> impl Fn(&Notification) -> bool + '_ {
    move |notification| {
        matches!(
            notification,
            Notification::CellOp(op) if op.cell_id == cell_id && op.status == Some(CellStatus::Running)
        )
    }
}

#[cfg(unix)]
fn process_exists(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}

fn execute(session: &Session, cell_id: &str, code: &str) {
    session.put_control_request(
        Command::execute_cells(vec![cell_id.into()], vec![code.into()]).unwrap(),
        Some("main"),
    );
}

#[tokio::test]
async fn test_process_kernel_executes_and_closes() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let path = write_notebook(dir.path(), "nb.py", &[("c1", "x = 1 + 1")]);
    let manager = manager(SessionMode::Edit, RuntimeConfig::default(), &dir);

    let (consumer, mut rx) = ChannelConsumer::new("main");
    let session = manager
        .create_session("s1".into(), consumer, true, BTreeMap::new(), file_key(&path), false)
        .await
        .unwrap();
    let pid = session.kernel_pid().expect("edit mode runs a kernel process");
    assert!(pid > 0);
    assert_eq!(session.kernel_state(), KernelState::Running);

    execute(&session, "c1", "x = 1 + 1");
    let idle = wait_for(&mut rx, is_idle("c1")).await;
    assert_eq!(output_text(&idle).as_deref(), Some("2"));

    assert!(manager.close_session("s1").await);
    assert!(eventually(|| !session.is_kernel_alive()).await);
    #[cfg(unix)]
    assert!(eventually(|| !process_exists(pid)).await);
}

#[tokio::test]
async fn test_slider_burst_applies_last_value() {
    let dir = TempDir::new().unwrap();
    let path = write_notebook(dir.path(), "nb.py", &[("c1", "x = 1 + 1")]);
    let manager = manager(SessionMode::Edit, RuntimeConfig::default(), &dir);

    let (consumer, mut rx) = ChannelConsumer::new("main");
    let session = manager
        .create_session("s1".into(), consumer, true, BTreeMap::new(), file_key(&path), false)
        .await
        .unwrap();
    next(&mut rx).await;

    for value in 1..=3 {
        session.put_control_request(
            Command::update_ui_element(vec!["slider".into()], vec![json!(value)]).unwrap(),
            Some("main"),
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    wait_for(&mut rx, |n| {
        matches!(
            n,
            Notification::VariableValues { variables }
                if variables.iter().any(|v| v.name == "slider" && v.value.as_deref() == Some("3"))
        )
    })
    .await;
    manager.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_sigint_interrupts_running_cell() {
    let dir = TempDir::new().unwrap();
    let path = write_notebook(dir.path(), "nb.py", &[("c1", "wait()"), ("c2", "y = 2 + 2")]);
    let manager = manager(SessionMode::Edit, RuntimeConfig::default(), &dir);

    let (consumer, mut rx) = ChannelConsumer::new("main");
    let session = manager
        .create_session("s1".into(), consumer, true, BTreeMap::new(), file_key(&path), false)
        .await
        .unwrap();

    execute(&session, "c1", "wait()");
    wait_for(&mut rx, is_running("c1")).await;
    session.try_interrupt();
    wait_for(&mut rx, |n| matches!(n, Notification::Interrupted)).await;

    // The kernel survives the interrupt and keeps serving.
    assert!(session.is_kernel_alive());
    execute(&session, "c2", "y = 2 + 2");
    let idle = wait_for(&mut rx, is_idle("c2")).await;
    assert_eq!(output_text(&idle).as_deref(), Some("4"));
    manager.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_unresponsive_kernel_is_killed_after_grace() {
    let dir = TempDir::new().unwrap();
    let path = write_notebook(dir.path(), "nb.py", &[("c1", "hang()")]);
    let launcher = launcher().with_timeouts(Duration::from_millis(300), Duration::from_secs(30));
    let manager = manager_with(SessionMode::Edit, RuntimeConfig::default(), &dir, launcher);

    let (consumer, mut rx) = ChannelConsumer::new("main");
    let session = manager
        .create_session("s1".into(), consumer, true, BTreeMap::new(), file_key(&path), false)
        .await
        .unwrap();
    let pid = session.kernel_pid().unwrap();

    execute(&session, "c1", "hang()");
    wait_for(&mut rx, is_running("c1")).await;

    manager.close_session("s1").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(process_exists(pid), "killed before the grace window ended");
    assert!(eventually(|| !process_exists(pid)).await);
}

#[tokio::test]
async fn test_edit_mode_without_kernel_command_fails() {
    let dir = TempDir::new().unwrap();
    let path = write_notebook(dir.path(), "nb.py", &[("c1", "x = 1 + 1")]);
    let launcher = DefaultKernelLauncher::new(Arc::new(CalculatorFactory));
    let manager = manager_with(SessionMode::Edit, RuntimeConfig::default(), &dir, launcher);

    let (consumer, _rx) = ChannelConsumer::new("main");
    let err = manager
        .create_session("s1".into(), consumer, true, BTreeMap::new(), file_key(&path), false)
        .await
        .err().expect("expected create_session to fail");
    assert!(matches!(
        err,
        SessionError::Kernel(KernelError::NoKernelCommand(SessionMode::Edit))
    ));
    assert_eq!(manager.session_count(), 0);
}
