// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Service Tunnel Contributors

// Service Tunnel - Lifecycle Module
// Owns the listener and the transport of one running tunnel and coordinates
// the single teardown pass

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use service_tunnel_common::{Error, Result, TunnelRequest};

use crate::credentials::CredentialStore;
use crate::forward;
use crate::transport::RemoteTransport;

/// Control handle for a running tunnel session. Stop requests and teardown
/// completion are the only things the owner of a tunnel gets to see.
pub struct TunnelHandle {
    local_port: u16,
    cancel: CancellationToken,
    closed: watch::Receiver<bool>,
}

impl TunnelHandle {
    /// Request shutdown. Safe to call any number of times, from any task;
    /// the first call wins and the rest are no-ops.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// The cancellation token every stop source feeds into (signal handler,
    /// operator keypress, replica redirect)
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait until teardown has finished and the local port is free again
    pub async fn closed(&mut self) {
        let _ = self.closed.wait_for(|done| *done).await;
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }
}

/// The live tunnel: authenticated transport, local listener, and the
/// transient credential material to clean up when it goes away
pub struct TunnelSession {
    transport: Arc<dyn RemoteTransport>,
    listener: TcpListener,
    remote_host: String,
    remote_port: u16,
    label: String,
    credentials: Option<Arc<dyn CredentialStore>>,
    cancel: CancellationToken,
    closed_tx: watch::Sender<bool>,
}

impl TunnelSession {
    /// Bind the local port and start accepting. Returns once the listener is
    /// live; forwarding and teardown run in a background task owned by the
    /// session.
    pub async fn open(
        transport: Box<dyn RemoteTransport>,
        request: &TunnelRequest,
        credentials: Option<Arc<dyn CredentialStore>>,
    ) -> Result<TunnelHandle> {
        let local_port = request.local_port();
        let listener = TcpListener::bind(("127.0.0.1", local_port))
            .await
            .map_err(|e| {
                Error::Tunnel(format!("Failed to bind 127.0.0.1:{}: {}", local_port, e))
            })?;
        info!("{}: listening on 127.0.0.1:{}", request.label, local_port);

        let cancel = CancellationToken::new();
        let (closed_tx, closed_rx) = watch::channel(false);

        let session = TunnelSession {
            transport: Arc::from(transport),
            listener,
            remote_host: request.remote_host.clone(),
            remote_port: request.remote_port,
            label: request.label.clone(),
            credentials,
            cancel: cancel.clone(),
            closed_tx,
        };
        tokio::spawn(session.run());

        Ok(TunnelHandle {
            local_port,
            cancel,
            closed: closed_rx,
        })
    }

    async fn run(self) {
        let result = forward::accept_loop(
            &self.listener,
            &self.transport,
            &self.remote_host,
            self.remote_port,
            &self.cancel,
        )
        .await;

        if let Err(e) = result {
            warn!("{}: forwarding stopped: {}", self.label, e);
        }
        self.teardown().await;
    }

    /// Runs exactly once, whatever ended the accept loop. The listener goes
    /// first so no new connections are handed out, then the transport so
    /// in-flight forwards observe end-of-stream, then the transient
    /// credential files. Every step is best-effort; completion does not wait
    /// for individual byte copies to drain.
    async fn teardown(self) {
        info!("{}: closing tunnel", self.label);
        // Wakes anyone waiting on the control handle when the session died
        // on its own rather than by request
        self.cancel.cancel();
        drop(self.listener);
        self.transport.close().await;
        if let Some(store) = &self.credentials {
            if let Err(e) = store.remove().await {
                warn!("Failed to remove transient credentials: {}", e);
            }
        }
        let _ = self.closed_tx.send(true);
        debug!("{}: tunnel closed", self.label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use service_tunnel_common::{
        AppTarget, ConnectionInfo, InstanceStat, PlatformApi, ServiceKind,
    };

    use crate::auth::ConsentPrompt;
    use crate::transport::ChannelStream;
    use crate::TunnelOpener;

    /// Transport whose channels are wired to a local stand-in service.
    /// Closing it drops all channel plumbing, so open relays observe EOF
    /// exactly like SSH channels do when the real transport dies.
    struct MockTransport {
        remote: SocketAddr,
        closed: CancellationToken,
        fail_dials: AtomicU32,
    }

    impl MockTransport {
        fn new(remote: SocketAddr) -> Self {
            Self {
                remote,
                closed: CancellationToken::new(),
                fail_dials: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl RemoteTransport for MockTransport {
        async fn open_channel(
            &self,
            _host: &str,
            _port: u16,
            _originator: SocketAddr,
        ) -> Result<Box<dyn ChannelStream>> {
            if self
                .fail_dials
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Gateway("dial refused".to_string()));
            }

            let mut upstream = TcpStream::connect(self.remote).await?;
            let (near, mut far) = tokio::io::duplex(8 * 1024);
            let closed = self.closed.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = closed.cancelled() => {}
                    _ = tokio::io::copy_bidirectional(&mut far, &mut upstream) => {}
                }
            });
            Ok(Box::new(near))
        }

        async fn close(&self) {
            self.closed.cancel();
        }
    }

    /// Control plane that must never be reached; an occupied local port has
    /// to fail the open before any authentication work starts
    struct UnreachableApi;

    #[async_trait]
    impl PlatformApi for UnreachableApi {
        async fn first_process_guid(&self, _app_guid: &str) -> Result<String> {
            panic!("authentication must not run when the port is occupied");
        }

        async fn ssh_code(&self) -> Result<String> {
            panic!("authentication must not run when the port is occupied");
        }

        async fn process_stats(&self, _app_guid: &str) -> Result<Vec<InstanceStat>> {
            panic!("authentication must not run when the port is occupied");
        }

        async fn ssh_enabled(&self, _app_guid: &str) -> Result<bool> {
            panic!("authentication must not run when the port is occupied");
        }

        async fn enable_ssh(&self, _app_guid: &str) -> Result<()> {
            panic!("authentication must not run when the port is occupied");
        }

        async fn restart_rolling(&self, _app_guid: &str, _app_name: &str) -> Result<()> {
            panic!("authentication must not run when the port is occupied");
        }
    }

    struct NoPrompt;

    #[async_trait]
    impl ConsentPrompt for NoPrompt {
        async fn confirm(&self, _question: &str) -> Result<bool> {
            Ok(false)
        }
    }

    /// Records whether transient credentials were cleaned up
    struct MockCredentialStore {
        removed: AtomicBool,
    }

    #[async_trait]
    impl CredentialStore for MockCredentialStore {
        async fn save(&self, _material: &crate::credentials::TlsMaterial) -> Result<()> {
            Ok(())
        }

        async fn remove(&self) -> Result<()> {
            self.removed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn spawn_echo_server() -> SocketAddr {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        addr
    }

    fn request(service: ServiceKind, remote_port: u16) -> TunnelRequest {
        let app = AppTarget {
            guid: "a-1".to_string(),
            name: "my-app".to_string(),
        };
        let info = ConnectionInfo {
            username: "user".to_string(),
            password: "secret".to_string(),
            hostname: "service.internal".to_string(),
            dbname: "apps".to_string(),
            port: remote_port,
        };
        TunnelRequest::new(app, service, &info)
    }

    async fn connect_local(port: u16) -> TcpStream {
        TcpStream::connect(("127.0.0.1", port)).await.unwrap()
    }

    // Exercises the postgres port (5432) end to end: concurrent idempotent
    // stop, credential cleanup, and immediate port reuse after Closed.
    #[tokio::test]
    async fn test_stop_is_idempotent_and_frees_the_port() {
        let echo = spawn_echo_server().await;
        let store = Arc::new(MockCredentialStore {
            removed: AtomicBool::new(false),
        });
        let req = request(ServiceKind::Postgres, echo.port());

        let mut handle = TunnelSession::open(
            Box::new(MockTransport::new(echo)),
            &req,
            Some(store.clone() as Arc<dyn CredentialStore>),
        )
        .await
        .unwrap();
        assert!(!crate::port::is_port_free(5432).await);

        // A second open for the same port fails the preflight before any
        // control-plane call is made
        let opener = TunnelOpener::new(
            Arc::new(UnreachableApi),
            Arc::new(NoPrompt),
            "127.0.0.1:2222",
        );
        match opener.open(&req, None).await {
            Err(Error::PortOccupied(port)) => assert_eq!(port, 5432),
            other => panic!("expected PortOccupied, got {:?}", other.err()),
        }

        // Two concurrent stop requests; teardown must run exactly once and
        // both callers see completion.
        let first = handle.cancel_token();
        let second = handle.cancel_token();
        let a = tokio::spawn(async move { first.cancel() });
        let b = tokio::spawn(async move { second.cancel() });
        a.await.unwrap();
        b.await.unwrap();
        handle.closed().await;

        assert!(store.removed.load(Ordering::SeqCst));
        assert!(crate::port::is_port_free(5432).await);

        // The port is immediately rebindable by a fresh session
        let mut replacement =
            TunnelSession::open(Box::new(MockTransport::new(echo)), &req, None)
                .await
                .unwrap();
        let mut client = connect_local(5432).await;
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        replacement.stop();
        replacement.closed().await;
    }

    // Exercises the redis port (6380): relay correctness, isolation of
    // failed dials, and stop with connections mid-copy.
    #[tokio::test]
    async fn test_relay_isolation_and_drain() {
        let echo = spawn_echo_server().await;
        let transport = MockTransport::new(echo);
        transport.fail_dials.store(2, Ordering::SeqCst);
        let req = request(ServiceKind::Redis, echo.port());

        let mut handle = TunnelSession::open(Box::new(transport), &req, None)
            .await
            .unwrap();

        // The first two dials are refused; those clients just see EOF while
        // the listener stays up.
        for _ in 0..2 {
            let mut rejected = connect_local(6380).await;
            let mut buf = Vec::new();
            let n = rejected.read_to_end(&mut buf).await.unwrap();
            assert_eq!(n, 0);
        }

        // The next connection relays both ways through the echo service
        let mut client = connect_local(6380).await;
        client.write_all(b"role check").await.unwrap();
        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"role check");

        // Three more connections sit mid-copy while we stop the session
        let mut idle = Vec::new();
        for _ in 0..3 {
            let mut stream = connect_local(6380).await;
            stream.write_all(b"x").await.unwrap();
            let mut one = [0u8; 1];
            stream.read_exact(&mut one).await.unwrap();
            idle.push(stream);
        }

        handle.stop();
        handle.closed().await;

        // Closing the transport unwinds every in-flight forward
        for mut stream in idle {
            let mut rest = Vec::new();
            let n = tokio::time::timeout(
                Duration::from_secs(5),
                stream.read_to_end(&mut rest),
            )
            .await
            .expect("relay did not observe end-of-stream")
            .unwrap();
            assert_eq!(n, 0);
        }

        assert!(crate::port::is_port_free(6380).await);
    }
}
