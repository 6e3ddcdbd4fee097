//! Async ICE agent
//!
//! [`IceAgent`] is a cheap, cloneable handle to one tokio task that owns the
//! [`IceSession`] and the host sockets. Every method sends a closure to that
//! task and awaits its reply, so all protocol state is touched from a single
//! place. Datagrams from the sockets and the session's timers are served by
//! the same task.
//!
//! Events are delivered on an unbounded channel and application data on a
//! bounded one; data that finds the channel full is dropped.

use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant as TokioInstant};
use tracing::{debug, info, warn};

use crate::candidate::Candidate;
use crate::config::{IceConfig, IceRole};
use crate::error::{Error, Result};
use crate::event::{IceAgentEvent, ReceivedData};
use crate::session::IceSession;
use crate::socket::{host_addresses, Datagram, SocketSet};
use crate::stream::{ComponentId, ComponentState, Credentials, StreamId, StreamState};

/// Capacity of the received data channel
const DATA_CHANNEL_CAPACITY: usize = 100;

type Call = Box<dyn FnOnce(&mut Driver, Instant) + Send>;

/// Clock used for the session. Follows tokio's clock so paused test time works.
fn now() -> Instant {
    TokioInstant::now().into_std()
}

/// Handle to a running ICE agent
#[derive(Clone)]
pub struct IceAgent {
    calls: mpsc::UnboundedSender<Call>,
}

impl std::fmt::Debug for IceAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IceAgent")
            .field("closed", &self.calls.is_closed())
            .finish()
    }
}

impl IceAgent {
    /// Create an agent and start its task.
    ///
    /// Returns the agent, the event receiver and the received data receiver.
    pub async fn new(
        config: IceConfig,
    ) -> Result<(
        Self,
        mpsc::UnboundedReceiver<IceAgentEvent>,
        mpsc::Receiver<ReceivedData>,
    )> {
        let session = IceSession::new(config)?;
        info!(
            "Creating ICE agent: role {}, ufrag {}",
            session.role(),
            session.local_credentials().ufrag
        );

        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);
        let (sockets, datagrams) = SocketSet::new();

        let driver = Driver {
            session,
            sockets,
            events_tx,
            data_tx,
        };
        tokio::spawn(driver.run(calls_rx, datagrams));

        Ok((Self { calls: calls_tx }, events_rx, data_rx))
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Driver, Instant) -> T + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let call: Call = Box::new(move |driver, now| {
            let _ = reply_tx.send(f(driver, now));
        });
        self.calls.send(call).map_err(|_| Error::AgentClosed)?;
        reply_rx.await.map_err(|_| Error::AgentClosed)
    }

    /// Add a stream. `None` uses the configured component count.
    pub async fn create_stream(&self, components: Option<u16>) -> Result<StreamId> {
        self.call(move |d, _| d.session.add_stream(components)).await?
    }

    /// Bind host sockets for every component and start gathering
    pub async fn gather_candidates(&self, stream_id: StreamId) -> Result<()> {
        self.call(move |d, now| d.gather(now, stream_id)).await?
    }

    pub async fn local_credentials(&self) -> Result<Credentials> {
        self.call(|d, _| d.session.local_credentials().clone()).await
    }

    pub async fn set_remote_credentials(&self, ufrag: &str, pwd: &str) -> Result<()> {
        let (ufrag, pwd) = (ufrag.to_string(), pwd.to_string());
        self.call(move |d, now| d.session.set_remote_credentials(now, &ufrag, &pwd))
            .await
    }

    /// Add a remote candidate from an SDP `candidate:` line
    pub async fn add_remote_candidate(&self, stream_id: StreamId, sdp: &str) -> Result<()> {
        let sdp = sdp.to_string();
        self.call(move |d, now| d.session.add_remote_candidate_sdp(now, stream_id, &sdp))
            .await?
    }

    pub async fn add_remote_candidate_obj(&self, stream_id: StreamId, candidate: Candidate) -> Result<()> {
        self.call(move |d, now| d.session.add_remote_candidate(now, stream_id, candidate))
            .await?
    }

    pub async fn local_candidates(&self, stream_id: StreamId) -> Result<Vec<Candidate>> {
        self.call(move |d, _| d.session.local_candidates(stream_id)).await?
    }

    pub async fn local_candidates_sdp(&self, stream_id: StreamId) -> Result<Vec<String>> {
        self.call(move |d, _| d.session.local_candidates_sdp(stream_id)).await?
    }

    pub async fn remote_candidates(&self, stream_id: StreamId) -> Result<Vec<Candidate>> {
        self.call(move |d, _| d.session.remote_candidates(stream_id)).await?
    }

    pub async fn selected_pair(
        &self,
        stream_id: StreamId,
        component_id: ComponentId,
    ) -> Result<Option<(Candidate, Candidate)>> {
        self.call(move |d, _| d.session.selected_pair(stream_id, component_id))
            .await?
    }

    pub async fn component_state(&self, stream_id: StreamId, component_id: ComponentId) -> Result<ComponentState> {
        self.call(move |d, _| d.session.component_state(stream_id, component_id))
            .await?
    }

    pub async fn stream_state(&self, stream_id: StreamId) -> Result<StreamState> {
        self.call(move |d, _| d.session.stream_state(stream_id)).await?
    }

    /// Change the role before checks begin
    pub async fn set_controlling(&self, controlling: bool) -> Result<()> {
        let role = if controlling {
            IceRole::Controlling
        } else {
            IceRole::Controlled
        };
        self.call(move |d, _| d.session.set_role(role)).await?
    }

    pub async fn role(&self) -> Result<IceRole> {
        self.call(|d, _| d.session.role()).await
    }

    /// Set the IP TOS of a stream's sockets, now and for sockets bound later
    pub async fn set_tos(&self, stream_id: StreamId, tos: u32) -> Result<()> {
        self.call(move |d, _| {
            d.session.set_tos(stream_id, tos)?;
            d.sockets.set_tos(stream_id, tos)
        })
        .await?
    }

    pub async fn set_software(&self, software: Option<String>) -> Result<()> {
        self.call(move |d, _| d.session.set_software(software)).await
    }

    /// Send data on the selected pair of a component
    pub async fn send(&self, stream_id: StreamId, component_id: ComponentId, data: &[u8]) -> Result<usize> {
        let data = data.to_vec();
        self.call(move |d, now| d.session.send(now, stream_id, component_id, &data))
            .await?
    }

    /// ICE restart: new local credentials, checks start over once new remote
    /// credentials and candidates are supplied
    pub async fn restart(&self) -> Result<()> {
        self.call(|d, _| d.session.restart()).await
    }

    pub async fn remove_stream(&self, stream_id: StreamId) -> Result<()> {
        self.call(move |d, _| {
            d.session.remove_stream(stream_id)?;
            d.sockets.close_stream(stream_id);
            Ok(())
        })
        .await?
    }

    /// Release TURN allocations, close the sockets and stop the task
    pub async fn close(&self) -> Result<()> {
        self.call(|d, _| d.session.close()).await
    }

    pub fn is_closed(&self) -> bool {
        self.calls.is_closed()
    }
}

/// State owned by the agent task
struct Driver {
    session: IceSession,
    sockets: SocketSet,
    events_tx: mpsc::UnboundedSender<IceAgentEvent>,
    data_tx: mpsc::Sender<ReceivedData>,
}

impl Driver {
    async fn run(mut self, mut calls: mpsc::UnboundedReceiver<Call>, mut datagrams: mpsc::Receiver<Datagram>) {
        loop {
            self.flush();
            if self.session.is_closed() {
                break;
            }

            let deadline = self.session.poll_timeout();
            let timer = async move {
                match deadline {
                    Some(at) => sleep_until(TokioInstant::from_std(at)).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                call = calls.recv() => match call {
                    Some(call) => call(&mut self, now()),
                    None => {
                        debug!("Every agent handle dropped");
                        self.session.close();
                    }
                },
                Some(datagram) = datagrams.recv() => {
                    self.session.handle_receive(now(), datagram.local, datagram.from, &datagram.data);
                }
                _ = timer => self.session.handle_timeout(now()),
            }
        }

        self.sockets.close();
        info!("ICE agent task terminated");
    }

    fn gather(&mut self, now: Instant, stream_id: StreamId) -> Result<()> {
        let (components, tos) = {
            let stream = self
                .session
                .stream(stream_id)
                .ok_or(Error::UnknownStream(stream_id))?;
            if stream.components.iter().any(|c| c.gathering.started) {
                return Err(Error::InvalidState(format!(
                    "gathering already started for stream {}",
                    stream_id
                )));
            }
            (stream.components.len() as u16, stream.tos)
        };
        let config = self.session.config();
        let (ips, port_range) = (host_addresses(config), config.port_range);

        let mut bases = Vec::new();
        for component_id in 1..=components {
            for ip in &ips {
                match self.sockets.bind(stream_id, *ip, port_range) {
                    Ok(local) => bases.push((component_id, local)),
                    Err(e) => warn!("Failed to bind {} for component {}: {}", ip, component_id, e),
                }
            }
        }
        if bases.is_empty() {
            return Err(Error::SocketAllocation(format!(
                "no local address could be bound for stream {}",
                stream_id
            )));
        }
        if let Some(tos) = tos {
            self.sockets.set_tos(stream_id, tos)?;
        }
        self.session.gather_candidates(now, stream_id, &bases)
    }

    /// Push out everything the session produced
    fn flush(&mut self) {
        while let Some(transmit) = self.session.poll_transmit() {
            self.sockets.send(&transmit);
        }
        while let Some(event) = self.session.poll_event() {
            let _ = self.events_tx.send(event);
        }
        while let Some(data) = self.session.poll_data() {
            match self.data_tx.try_send(data) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(data)) => {
                    warn!(
                        "Data channel full, dropping {} bytes for stream {} component {}",
                        data.data.len(),
                        data.stream_id,
                        data.component_id
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }
}
