// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! TCP connection table and the user-facing socket handles.
//!
//! The table demultiplexes segments by 4-tuple with listeners as wildcard
//! entries. Each connection's [`Tcb`] sits behind its own mutex; segments a
//! TCB produces are collected and handed back to the stack, which
//! transmits them after every socket lock is released.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::{NetError, Result};
use crate::stack::{NetStack, SendOptions};
use crate::tcp::{reset_for, OutSegment, Tcb, TcpFlags, TcpHeader, TcpState};
use crate::udp::{Datagram, UdpEndpoint, EPHEMERAL_FIRST, EPHEMERAL_LAST};

type ConnKey = (SocketAddrV4, SocketAddrV4);

/// One connection: the TCB plus the condition variable its users wait on.
pub struct TcpConn {
    tcb: Mutex<Tcb>,
    changed: Condvar,
    parent: Mutex<Option<Arc<Listener>>>,
}

impl TcpConn {
    fn new(tcb: Tcb, parent: Option<Arc<Listener>>) -> Arc<Self> {
        Arc::new(Self { tcb: Mutex::new(tcb), changed: Condvar::new(), parent: Mutex::new(parent) })
    }

    /// Current state.
    pub fn state(&self) -> TcpState {
        self.tcb.lock().state
    }

    /// Local and remote endpoints.
    pub fn endpoints(&self) -> ConnKey {
        let tcb = self.tcb.lock();
        (tcb.local, tcb.remote)
    }

    /// Runs `f` against the TCB.
    pub fn with_tcb<R>(&self, f: impl FnOnce(&Tcb) -> R) -> R {
        f(&self.tcb.lock())
    }
}

/// Passive socket: children that finished the handshake wait in `ready`.
pub struct Listener {
    local: SocketAddrV4,
    backlog: usize,
    half_open: AtomicUsize,
    ready: Mutex<VecDeque<Arc<TcpConn>>>,
    arrived: Condvar,
    closed: AtomicBool,
}

impl Listener {
    fn has_room(&self) -> bool {
        self.half_open.load(Ordering::Acquire) + self.ready.lock().len() < self.backlog
    }

    /// Queues a child that finished its handshake. Returns false once the
    /// listener is closed; the caller then owns the child.
    fn push_ready(&self, conn: Arc<TcpConn>) -> bool {
        self.half_open.fetch_sub(1, Ordering::AcqRel);
        let mut ready = self.ready.lock();
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        ready.push_back(conn);
        drop(ready);
        self.arrived.notify_all();
        true
    }

    fn drop_half_open(&self) {
        self.half_open.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Connections, listeners and reserved local ports.
pub struct TcpTable {
    conns: RwLock<HashMap<ConnKey, Arc<TcpConn>>>,
    listeners: RwLock<HashMap<SocketAddrV4, Arc<Listener>>>,
    bound: Mutex<HashSet<SocketAddrV4>>,
    next_ephemeral: Mutex<u16>,
}

impl Default for TcpTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTable {
    /// Empty table.
    pub fn new() -> Self {
        Self {
            conns: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            bound: Mutex::new(HashSet::new()),
            next_ephemeral: Mutex::new(EPHEMERAL_FIRST),
        }
    }

    fn port_taken(bound: &HashSet<SocketAddrV4>, ip: Ipv4Addr, port: u16) -> bool {
        bound.iter().any(|b| b.port() == port && (b.ip() == &ip || b.ip().is_unspecified() || ip.is_unspecified()))
    }

    /// Reserves a local address; port 0 picks an ephemeral port.
    pub fn reserve(&self, addr: SocketAddrV4) -> Result<SocketAddrV4> {
        let mut bound = self.bound.lock();
        if addr.port() != 0 {
            if Self::port_taken(&bound, *addr.ip(), addr.port()) {
                return Err(NetError::AddrInUse);
            }
            bound.insert(addr);
            return Ok(addr);
        }
        let mut cursor = self.next_ephemeral.lock();
        let span = u32::from(EPHEMERAL_LAST - EPHEMERAL_FIRST) + 1;
        for _ in 0..span {
            let port = *cursor;
            *cursor = if port == EPHEMERAL_LAST { EPHEMERAL_FIRST } else { port + 1 };
            if !Self::port_taken(&bound, *addr.ip(), port) {
                let local = SocketAddrV4::new(*addr.ip(), port);
                bound.insert(local);
                return Ok(local);
            }
        }
        Err(NetError::AddrNotAvail)
    }

    /// Returns a reserved address to the pool.
    pub fn release(&self, addr: SocketAddrV4) {
        self.bound.lock().remove(&addr);
    }

    fn listen(&self, local: SocketAddrV4, backlog: usize) -> Result<Arc<Listener>> {
        let mut listeners = self.listeners.write();
        if listeners.contains_key(&local) {
            return Err(NetError::AddrInUse);
        }
        let listener = Arc::new(Listener {
            local,
            backlog: backlog.max(1),
            half_open: AtomicUsize::new(0),
            ready: Mutex::new(VecDeque::new()),
            arrived: Condvar::new(),
            closed: AtomicBool::new(false),
        });
        listeners.insert(local, Arc::clone(&listener));
        log::debug!("tcp: listening on {} backlog {}", local, listener.backlog);
        Ok(listener)
    }

    fn unlisten(&self, listener: &Listener) -> Vec<Arc<TcpConn>> {
        self.listeners.write().remove(&listener.local);
        let pending = {
            let mut ready = listener.ready.lock();
            listener.closed.store(true, Ordering::Release);
            ready.drain(..).collect()
        };
        listener.arrived.notify_all();
        pending
    }

    fn insert(&self, conn: Arc<TcpConn>) -> Result<()> {
        let key = conn.endpoints();
        let mut conns = self.conns.write();
        if conns.contains_key(&key) {
            return Err(NetError::AddrInUse);
        }
        conns.insert(key, conn);
        Ok(())
    }

    fn remove(&self, key: &ConnKey) {
        self.conns.write().remove(key);
    }

    /// Connection lookup by exact 4-tuple.
    pub fn lookup(&self, local: SocketAddrV4, remote: SocketAddrV4) -> Option<Arc<TcpConn>> {
        self.conns.read().get(&(local, remote)).cloned()
    }

    fn listener_for(&self, local: SocketAddrV4) -> Option<Arc<Listener>> {
        let listeners = self.listeners.read();
        listeners
            .get(&local)
            .or_else(|| listeners.get(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, local.port())))
            .cloned()
    }

    /// Live connections.
    pub fn len(&self) -> usize {
        self.conns.read().len()
    }

    /// True when no connection exists.
    pub fn is_empty(&self) -> bool {
        self.conns.read().is_empty()
    }

    /// Demultiplexes one segment; returns segments to transmit.
    pub(crate) fn input(
        &self,
        local: SocketAddrV4,
        remote: SocketAddrV4,
        hdr: &TcpHeader,
        payload: &[u8],
        params: ConnParams,
        now_ns: u64,
    ) -> Vec<OutSegment> {
        let mut out = Vec::new();
        if let Some(conn) = self.lookup(local, remote) {
            let _ = self.drive(&conn, &mut out, |tcb, out| tcb.input(hdr, payload, now_ns, out));
            return out;
        }
        let listener = self.listener_for(local).filter(|l| !l.closed.load(Ordering::Acquire));
        let is_syn = hdr.flags.contains(TcpFlags::SYN) && !hdr.flags.intersects(TcpFlags::ACK | TcpFlags::RST);
        match listener {
            Some(listener) if is_syn => {
                if !listener.has_room() {
                    log::debug!("tcp: {} backlog full, dropping SYN from {}", local, remote);
                    return out;
                }
                let iss = rand::random::<u32>();
                let (mut child, synack) = Tcb::accept_syn(local, remote, hdr, iss, params.mss, params.rcvbuf, now_ns);
                child.set_sndbuf(params.sndbuf);
                listener.half_open.fetch_add(1, Ordering::AcqRel);
                if self.insert(TcpConn::new(child, Some(listener))).is_ok() {
                    out.push(synack);
                }
            }
            _ => {
                if !hdr.flags.contains(TcpFlags::RST) {
                    log::trace!("tcp: no socket for {} from {}, resetting", local, remote);
                }
                out.extend(reset_for(local, remote, hdr, payload.len()));
            }
        }
        out
    }

    /// Applies `f` to the connection's TCB, then wakes waiters, promotes a
    /// finished handshake to its listener and retires closed connections.
    fn drive<F>(&self, conn: &Arc<TcpConn>, out: &mut Vec<OutSegment>, f: F) -> Result<()>
    where
        F: FnOnce(&mut Tcb, &mut Vec<OutSegment>) -> Result<()>,
    {
        let (res, mut state, key) = {
            let mut tcb = conn.tcb.lock();
            let res = f(&mut tcb, out);
            (res, tcb.state, (tcb.local, tcb.remote))
        };
        conn.changed.notify_all();
        if let Err(e) = res {
            log::debug!("tcp {} -> {}: {}", key.0, key.1, e);
        }
        let parent = match state {
            TcpState::SynRcvd => None,
            _ => conn.parent.lock().take(),
        };
        if let Some(listener) = parent {
            if state == TcpState::Closed {
                listener.drop_half_open();
            } else if !listener.push_ready(Arc::clone(conn)) {
                log::debug!("tcp {} -> {}: listener closed during handshake, resetting", key.0, key.1);
                conn.tcb.lock().abort(out);
                conn.changed.notify_all();
                state = TcpState::Closed;
            }
        }
        if state == TcpState::Closed {
            self.remove(&key);
        }
        res
    }

    /// Runs every due TCB timer.
    pub(crate) fn on_timer(&self, now_ns: u64) -> Vec<OutSegment> {
        let due: Vec<Arc<TcpConn>> = self
            .conns
            .read()
            .values()
            .filter(|c| c.tcb.lock().next_deadline().is_some_and(|d| d <= now_ns))
            .cloned()
            .collect();
        let mut out = Vec::new();
        for conn in due {
            let _ = self.drive(&conn, &mut out, |tcb, out| tcb.on_timer(now_ns, out));
        }
        out
    }

    /// Aborts every connection and listener.
    pub(crate) fn shutdown(&self) -> Vec<OutSegment> {
        let conns: Vec<Arc<TcpConn>> = self.conns.write().drain().map(|(_, c)| c).collect();
        let mut out = Vec::new();
        for conn in conns {
            conn.tcb.lock().abort(&mut out);
            conn.changed.notify_all();
        }
        let listeners: Vec<Arc<Listener>> = self.listeners.write().drain().map(|(_, l)| l).collect();
        for l in listeners {
            l.closed.store(true, Ordering::Release);
            l.arrived.notify_all();
        }
        self.bound.lock().clear();
        out
    }
}

/// Per-connection parameters chosen by the stack.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ConnParams {
    pub(crate) mss: u16,
    pub(crate) rcvbuf: usize,
    pub(crate) sndbuf: usize,
}

enum TcpInner {
    Fresh { local: Option<SocketAddrV4> },
    Listening { listener: Arc<Listener>, local: SocketAddrV4 },
    Connected { conn: Arc<TcpConn>, reserved: Option<SocketAddrV4> },
    Closed,
}

/// Stream socket.
pub struct TcpSocket {
    stack: Arc<NetStack>,
    inner: Mutex<TcpInner>,
}

fn deadline(timeout: Duration) -> Instant {
    Instant::now() + timeout
}

impl TcpSocket {
    pub(crate) fn new(stack: Arc<NetStack>) -> Self {
        Self { stack, inner: Mutex::new(TcpInner::Fresh { local: None }) }
    }

    fn connected(stack: Arc<NetStack>, conn: Arc<TcpConn>) -> Self {
        Self { stack, inner: Mutex::new(TcpInner::Connected { conn, reserved: None }) }
    }

    fn conn(&self) -> Result<Arc<TcpConn>> {
        match &*self.inner.lock() {
            TcpInner::Connected { conn, .. } => Ok(Arc::clone(conn)),
            TcpInner::Closed => Err(NetError::BadSocket),
            _ => Err(NetError::NotConnected),
        }
    }

    /// Reserves `addr` as the local address.
    pub fn bind(&self, addr: SocketAddrV4) -> Result<SocketAddrV4> {
        let mut inner = self.inner.lock();
        match &*inner {
            TcpInner::Fresh { local: None } => {
                let local = self.stack.tcp.reserve(addr)?;
                *inner = TcpInner::Fresh { local: Some(local) };
                Ok(local)
            }
            TcpInner::Closed => Err(NetError::BadSocket),
            _ => Err(NetError::Invalid("socket already bound")),
        }
    }

    /// Local address, once bound or connected.
    pub fn local_addr(&self) -> Option<SocketAddrV4> {
        match &*self.inner.lock() {
            TcpInner::Fresh { local } => *local,
            TcpInner::Listening { local, .. } => Some(*local),
            TcpInner::Connected { conn, .. } => Some(conn.endpoints().0),
            TcpInner::Closed => None,
        }
    }

    /// Peer address of a connected socket.
    pub fn peer_addr(&self) -> Result<SocketAddrV4> {
        Ok(self.conn()?.endpoints().1)
    }

    /// Starts accepting connections; unbound sockets get an ephemeral port.
    pub fn listen(&self, backlog: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        let local = match &*inner {
            TcpInner::Fresh { local: Some(local) } => *local,
            TcpInner::Fresh { local: None } => self.stack.tcp.reserve(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?,
            TcpInner::Listening { .. } => return Ok(()),
            TcpInner::Connected { .. } => return Err(NetError::IsConnected),
            TcpInner::Closed => return Err(NetError::BadSocket),
        };
        let listener = self.stack.tcp.listen(local, backlog)?;
        *inner = TcpInner::Listening { listener, local };
        Ok(())
    }

    /// Sends the SYN and returns; see [`Self::wait_connected`].
    pub fn connect(&self, remote: SocketAddrV4) -> Result<()> {
        let segments = {
            let mut inner = self.inner.lock();
            let requested = match &*inner {
                TcpInner::Fresh { local } => *local,
                TcpInner::Connected { .. } => return Err(NetError::IsConnected),
                TcpInner::Listening { .. } => return Err(NetError::Invalid("socket is listening")),
                TcpInner::Closed => return Err(NetError::BadSocket),
            };
            let src_ip = self.stack.source_for(*remote.ip())?;
            let (local, reserved) = match requested {
                Some(l) if l.ip().is_unspecified() => (SocketAddrV4::new(src_ip, l.port()), l),
                Some(l) => (l, l),
                None => {
                    let l = self.stack.tcp.reserve(SocketAddrV4::new(src_ip, 0))?;
                    (l, l)
                }
            };
            let params = self.stack.conn_params(*remote.ip());
            let now = self.stack.now_ns();
            let (mut tcb, syn) = Tcb::connect(local, remote, rand::random::<u32>(), params.mss, params.rcvbuf, now);
            tcb.set_sndbuf(params.sndbuf);
            let conn = TcpConn::new(tcb, None);
            self.stack.tcp.insert(Arc::clone(&conn))?;
            log::debug!("tcp: connecting {} -> {}", local, remote);
            *inner = TcpInner::Connected { conn, reserved: Some(reserved) };
            vec![syn]
        };
        self.stack.send_tcp(segments);
        Ok(())
    }

    /// Blocks until the handshake completes or fails.
    pub fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let conn = self.conn()?;
        let until = deadline(timeout);
        let mut tcb = conn.tcb.lock();
        loop {
            if let Some(err) = tcb.error() {
                return Err(err);
            }
            if tcb.user_closed() {
                return Err(NetError::BadSocket);
            }
            match tcb.state {
                TcpState::SynSent | TcpState::SynRcvd => {}
                TcpState::Closed => return Err(NetError::ConnRefused),
                _ => return Ok(()),
            }
            if conn.changed.wait_until(&mut tcb, until).timed_out() {
                return Err(NetError::TimedOut);
            }
        }
    }

    /// [`Self::connect`] followed by [`Self::wait_connected`].
    pub fn connect_timeout(&self, remote: SocketAddrV4, timeout: Duration) -> Result<()> {
        self.connect(remote)?;
        self.wait_connected(timeout)
    }

    fn listener(&self) -> Result<Arc<Listener>> {
        match &*self.inner.lock() {
            TcpInner::Listening { listener, .. } => Ok(Arc::clone(listener)),
            TcpInner::Closed => Err(NetError::BadSocket),
            _ => Err(NetError::Invalid("socket is not listening")),
        }
    }

    /// Takes an established connection or fails with `WouldBlock`.
    pub fn accept(&self) -> Result<TcpSocket> {
        let listener = self.listener()?;
        let conn = listener.ready.lock().pop_front();
        match conn {
            Some(conn) => Ok(Self::connected(Arc::clone(&self.stack), conn)),
            None => Err(NetError::WouldBlock),
        }
    }

    /// Waits up to `timeout` for a connection.
    pub fn accept_timeout(&self, timeout: Duration) -> Result<TcpSocket> {
        let listener = self.listener()?;
        let until = deadline(timeout);
        let mut ready = listener.ready.lock();
        loop {
            if let Some(conn) = ready.pop_front() {
                return Ok(Self::connected(Arc::clone(&self.stack), conn));
            }
            if listener.closed.load(Ordering::Acquire) {
                return Err(NetError::BadSocket);
            }
            if listener.arrived.wait_until(&mut ready, until).timed_out() {
                return Err(NetError::TimedOut);
            }
        }
    }

    /// Queues bytes; returns how many were accepted.
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        let conn = self.conn()?;
        let mut out = Vec::new();
        let now = self.stack.now_ns();
        let n = conn.tcb.lock().send(data, now, &mut out)?;
        self.stack.send_tcp(out);
        Ok(n)
    }

    /// Sends all of `data`, waiting for buffer space as needed.
    pub fn send_all(&self, mut data: &[u8], timeout: Duration) -> Result<()> {
        let conn = self.conn()?;
        let until = deadline(timeout);
        while !data.is_empty() {
            let mut out = Vec::new();
            let now = self.stack.now_ns();
            let res = {
                let mut tcb = conn.tcb.lock();
                match tcb.send(data, now, &mut out) {
                    Err(NetError::WouldBlock) => {
                        if conn.changed.wait_until(&mut tcb, until).timed_out() {
                            return Err(NetError::TimedOut);
                        }
                        Ok(0)
                    }
                    other => other,
                }
            };
            self.stack.send_tcp(out);
            data = &data[res?..];
        }
        Ok(())
    }

    /// Takes up to `max` bytes; `WouldBlock` when nothing is buffered and
    /// an empty vector at end of stream.
    pub fn recv(&self, max: usize) -> Result<Vec<u8>> {
        let conn = self.conn()?;
        let mut out = Vec::new();
        let res = conn.tcb.lock().recv(max, &mut out);
        self.stack.send_tcp(out);
        res
    }

    /// Waits up to `timeout` for data.
    pub fn recv_timeout(&self, max: usize, timeout: Duration) -> Result<Vec<u8>> {
        let conn = self.conn()?;
        let until = deadline(timeout);
        let mut out = Vec::new();
        let res = {
            let mut tcb = conn.tcb.lock();
            loop {
                match tcb.recv(max, &mut out) {
                    Err(NetError::WouldBlock) => {
                        if conn.changed.wait_until(&mut tcb, until).timed_out() {
                            break Err(NetError::TimedOut);
                        }
                    }
                    other => break other,
                }
            }
        };
        self.stack.send_tcp(out);
        res
    }

    /// Connection state; `Listen` for listeners, `Closed` before connect.
    pub fn state(&self) -> TcpState {
        match &*self.inner.lock() {
            TcpInner::Connected { conn, .. } => conn.state(),
            TcpInner::Listening { .. } => TcpState::Listen,
            _ => TcpState::Closed,
        }
    }

    /// Orderly close: FIN after queued data. Blocked readers and writers
    /// wake with `BadSocket`; listeners reset pending children.
    pub fn close(&self) {
        let prev = std::mem::replace(&mut *self.inner.lock(), TcpInner::Closed);
        let mut out = Vec::new();
        match prev {
            TcpInner::Fresh { local } => {
                if let Some(local) = local {
                    self.stack.tcp.release(local);
                }
            }
            TcpInner::Listening { listener, local } => {
                for child in self.stack.tcp.unlisten(&listener) {
                    let _ = self.stack.tcp.drive(&child, &mut out, |tcb, out| {
                        tcb.abort(out);
                        Ok(())
                    });
                }
                self.stack.tcp.release(local);
            }
            TcpInner::Connected { conn, reserved } => {
                let now = self.stack.now_ns();
                let _ = self.stack.tcp.drive(&conn, &mut out, |tcb, out| {
                    tcb.close(now, out);
                    Ok(())
                });
                if let Some(local) = reserved {
                    self.stack.tcp.release(local);
                }
            }
            TcpInner::Closed => {}
        }
        self.stack.send_tcp(out);
    }

    /// Hard close with RST.
    pub fn abort(&self) {
        let prev = std::mem::replace(&mut *self.inner.lock(), TcpInner::Closed);
        match prev {
            TcpInner::Connected { conn, reserved } => {
                let mut out = Vec::new();
                let _ = self.stack.tcp.drive(&conn, &mut out, |tcb, out| {
                    tcb.abort(out);
                    Ok(())
                });
                if let Some(local) = reserved {
                    self.stack.tcp.release(local);
                }
                self.stack.send_tcp(out);
            }
            other => {
                *self.inner.lock() = other;
                self.close();
            }
        }
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        self.close();
    }
}

/// Datagram socket.
pub struct UdpSocket {
    stack: Arc<NetStack>,
    endpoint: Arc<UdpEndpoint>,
    options: Mutex<SendOptions>,
}

impl UdpSocket {
    pub(crate) fn new(stack: Arc<NetStack>, endpoint: Arc<UdpEndpoint>) -> Self {
        let options = Mutex::new(stack.default_send_options());
        Self { stack, endpoint, options }
    }

    /// Bound address.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.endpoint.local()
    }

    /// Fixes the default destination and filters incoming datagrams.
    pub fn connect(&self, peer: SocketAddrV4) {
        self.endpoint.set_remote(Some(peer));
    }

    /// Sets the don't-fragment bit on later sends.
    pub fn set_dont_fragment(&self, df: bool) {
        self.options.lock().df = df;
    }

    /// Sets the TTL on later sends.
    pub fn set_ttl(&self, ttl: u8) {
        self.options.lock().ttl = ttl;
    }

    /// Sends one datagram to `dst`.
    pub fn send_to(&self, data: &[u8], dst: SocketAddrV4) -> Result<usize> {
        let opts = *self.options.lock();
        self.stack.send_udp(self.endpoint.local(), dst, data, opts)?;
        Ok(data.len())
    }

    /// Sends to the connected peer.
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        let peer = self.endpoint.remote().ok_or(NetError::NotConnected)?;
        self.send_to(data, peer)
    }

    /// Takes a queued datagram or fails with `WouldBlock`.
    pub fn recv_from(&self) -> Result<Datagram> {
        self.endpoint.try_recv()
    }

    /// Waits up to `timeout` for a datagram.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Datagram> {
        self.endpoint.recv_timeout(timeout)
    }

    /// Datagrams queued.
    pub fn pending(&self) -> usize {
        self.endpoint.pending()
    }

    /// Unbinds and wakes every waiter.
    pub fn close(&self) {
        self.stack.udp.unbind(self.endpoint.local());
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        self.close();
    }
}
