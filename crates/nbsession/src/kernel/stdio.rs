//! Child-process side of a process kernel.
//!
//! A kernel host binary calls [`run`] from its `main`: it prints the ready
//! token, reads the configure frame, then runs the kernel loop on a thread
//! while frames flow over stdin/stdout. stdout belongs to the protocol; the
//! runtime must write user output through its [`KernelContext`].
//!
//! [`KernelContext`]: super::runtime::KernelContext

use std::sync::Arc;

use anyhow::{bail, Context};
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

use crate::connection::{
    recv_json_frame, send_json_frame, write_ready_token, KernelInbound, KernelOutbound,
};
use crate::notifications::Notification;
use crate::queues::QueueManager;

use super::runtime::{run_kernel_loop, RuntimeFactory};

/// Host a kernel on this process's stdin/stdout.
///
/// SIGINT is turned into a cooperative interrupt the runtime observes via
/// `KernelContext::check_interrupt`.
pub async fn run(factory: Arc<dyn RuntimeFactory>) -> anyhow::Result<()> {
    serve_with_interrupts(factory, tokio::io::stdin(), tokio::io::stdout(), true).await
}

/// Host a kernel over an arbitrary reader/writer pair.
pub async fn serve<R, W>(factory: Arc<dyn RuntimeFactory>, reader: R, writer: W) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    serve_with_interrupts(factory, reader, writer, false).await
}

async fn serve_with_interrupts<R, W>(
    factory: Arc<dyn RuntimeFactory>,
    mut reader: R,
    mut writer: W,
    handle_sigint: bool,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    write_ready_token(&mut writer).await?;

    let launch = match recv_json_frame::<_, KernelInbound>(&mut reader).await? {
        Some(KernelInbound::Configure { launch }) => launch,
        Some(other) => bail!("expected configure frame, got {:?}", other),
        None => {
            debug!("[kernel-stdio] Session closed before configuring the kernel");
            return Ok(());
        }
    };
    info!("[kernel-stdio] Configured for {}", launch.file_key);

    let runtime = factory.create(&launch)?;
    let queues = Arc::new(QueueManager::new());
    let kernel_queues = queues
        .take_kernel_queues()
        .context("kernel queues already taken")?;
    let mut stream = queues
        .take_stream_receiver()
        .context("output stream already taken")?;

    // Dropped when the kernel thread ends, including by panic.
    let (done_tx, mut done_rx) = oneshot::channel::<()>();
    std::thread::Builder::new()
        .name("nbsession-kernel".into())
        .spawn(move || {
            let _done = done_tx;
            run_kernel_loop(runtime, kernel_queues, launch)
        })
        .context("failed to start kernel thread")?;

    let reader_queues = queues.clone();
    let reader_task = tokio::spawn(async move {
        loop {
            match recv_json_frame::<_, KernelInbound>(&mut reader).await {
                Ok(Some(frame)) => {
                    reader_queues.forward(frame);
                }
                Ok(None) => break,
                Err(e) if e.downcast_ref::<std::io::Error>().is_some() => {
                    warn!("[kernel-stdio] Session connection failed: {}", e);
                    break;
                }
                Err(e) => warn!("[kernel-stdio] Skipping malformed frame: {}", e),
            }
        }
        debug!("[kernel-stdio] Session closed the connection");
        reader_queues.close();
    });

    #[cfg(unix)]
    if handle_sigint {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
        let interrupt_queues = queues.clone();
        tokio::spawn(async move {
            while sigint.recv().await.is_some() {
                debug!("[kernel-stdio] SIGINT received");
                interrupt_queues.forward(KernelInbound::Interrupt);
            }
        });
    }
    #[cfg(not(unix))]
    let _ = handle_sigint;

    // The completion worker keeps the stream open, so the end of the kernel
    // thread is what ends the host.
    loop {
        tokio::select! {
            Some(notification) = stream.recv() => {
                if !write_notification(&mut writer, notification).await {
                    break;
                }
            }
            _ = &mut done_rx => {
                while let Ok(notification) = stream.try_recv() {
                    if !write_notification(&mut writer, notification).await {
                        break;
                    }
                }
                break;
            }
        }
    }

    reader_task.abort();
    info!("[kernel-stdio] Kernel host exiting");
    Ok(())
}

async fn write_notification<W: AsyncWrite + Unpin>(writer: &mut W, notification: Notification) -> bool {
    match send_json_frame(writer, &KernelOutbound::Notification { notification }).await {
        Ok(()) => true,
        Err(e) => {
            warn!("[kernel-stdio] Failed to write notification: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Command;
    use crate::connection::wait_for_ready_token;
    use crate::kernel::runtime::{KernelContext, KernelRuntime};
    use crate::kernel::KernelLaunchInfo;
    use crate::SessionMode;
    use std::collections::BTreeMap;
    use tokio::io::BufReader;

    struct Echo;

    impl KernelRuntime for Echo {
        fn handle_command(&mut self, command: Command, ctx: &mut KernelContext) -> anyhow::Result<()> {
            if let Command::ExecuteScratchpad { code } = command {
                if code == "panic" {
                    panic!("runtime failure");
                }
                ctx.emit(Notification::UpdateCellIds {
                    cell_ids: vec![code],
                });
            }
            Ok(())
        }
    }

    struct EchoFactory;

    impl RuntimeFactory for EchoFactory {
        fn create(&self, _launch: &KernelLaunchInfo) -> anyhow::Result<Box<dyn KernelRuntime>> {
            Ok(Box::new(Echo))
        }
    }

    fn launch_info() -> KernelLaunchInfo {
        KernelLaunchInfo {
            mode: SessionMode::Edit,
            file_key: "nb.py".into(),
            filename: None,
            cell_configs: BTreeMap::new(),
            query_params: BTreeMap::new(),
            user_config: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_serve_handshake_and_round_trip() {
        let (session_to_kernel, kernel_in) = tokio::io::duplex(64 * 1024);
        let (kernel_out, kernel_to_session) = tokio::io::duplex(64 * 1024);
        let host = tokio::spawn(serve(Arc::new(EchoFactory), kernel_in, kernel_out));

        let mut from_kernel = BufReader::new(kernel_to_session);
        wait_for_ready_token(&mut from_kernel).await.unwrap();

        let mut to_kernel = session_to_kernel;
        send_json_frame(&mut to_kernel, &KernelInbound::Configure { launch: launch_info() })
            .await
            .unwrap();
        send_json_frame(
            &mut to_kernel,
            &KernelInbound::Control {
                command: Command::ExecuteScratchpad { code: "hello".into() },
            },
        )
        .await
        .unwrap();

        let frame: KernelOutbound = recv_json_frame(&mut from_kernel).await.unwrap().unwrap();
        assert_eq!(
            frame,
            KernelOutbound::Notification {
                notification: Notification::UpdateCellIds {
                    cell_ids: vec!["hello".into()]
                }
            }
        );

        send_json_frame(
            &mut to_kernel,
            &KernelInbound::Control {
                command: Command::StopKernel,
            },
        )
        .await
        .unwrap();
        drop(to_kernel);

        tokio::time::timeout(std::time::Duration::from_secs(5), host)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_serve_exits_when_kernel_thread_dies() {
        let (mut to_kernel, kernel_in) = tokio::io::duplex(64 * 1024);
        let (kernel_out, kernel_to_session) = tokio::io::duplex(64 * 1024);
        let host = tokio::spawn(serve(Arc::new(EchoFactory), kernel_in, kernel_out));

        let mut from_kernel = BufReader::new(kernel_to_session);
        wait_for_ready_token(&mut from_kernel).await.unwrap();
        send_json_frame(&mut to_kernel, &KernelInbound::Configure { launch: launch_info() })
            .await
            .unwrap();
        send_json_frame(
            &mut to_kernel,
            &KernelInbound::Control {
                command: Command::ExecuteScratchpad { code: "panic".into() },
            },
        )
        .await
        .unwrap();

        // The session side is still connected; only the kernel thread ended.
        tokio::time::timeout(std::time::Duration::from_secs(5), host)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        drop(to_kernel);
    }

    #[tokio::test]
    async fn test_serve_rejects_missing_configure() {
        let (mut session_to_kernel, kernel_in) = tokio::io::duplex(1024);
        let (kernel_out, _kernel_to_session) = tokio::io::duplex(1024);
        send_json_frame(&mut session_to_kernel, &KernelInbound::Interrupt)
            .await
            .unwrap();

        let err = serve(Arc::new(EchoFactory), kernel_in, kernel_out)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expected configure frame"));
    }
}
