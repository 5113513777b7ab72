//! Multiplexed receive loop over a fixed set of raw sockets.
//!
//! One `poll(2)` per iteration covers every socket. Each ready socket gets a
//! single bounded read, in the order the sockets were supplied, before the
//! stop flag is looked at again. The poll timeout bounds how long a stop
//! request can go unnoticed.

use std::io;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::error::ReceiveError;
use crate::event::StopEvent;
use crate::socket::{DatagramSource, RawSocketSet};

pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveConfig {
    /// Longest single readiness wait.
    pub timeout: Duration,
    /// Largest datagram read in one go; longer ones are truncated.
    pub buffer_size: usize,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        ReceiveConfig {
            timeout: DEFAULT_WAIT_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Counters for one receive session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveStats {
    /// Times the stop flag was queried.
    pub stop_checks: u64,
    /// Readiness waits started.
    pub iterations: u64,
    /// Waits that ended with nothing readable.
    pub timeouts: u64,
    /// Waits cut short by a signal and retried.
    pub interrupts: u64,
    pub datagrams: u64,
    pub bytes: u64,
    /// Non-transient read errors, each logged and skipped.
    pub read_errors: u64,
    /// Sockets dropped from the wait set after `poll` flagged them invalid.
    pub invalid_handles: u64,
}

/// Blocks until at least one entry of `fds` is ready or `timeout_ms` passes.
///
/// Implementations fill in `revents` and return the number of ready
/// entries, 0 on timeout. Entries with a negative `fd` are never ready.
pub trait ReadinessWait {
    fn wait(&mut self, fds: &mut [libc::pollfd], timeout_ms: libc::c_int) -> io::Result<usize>;
}

/// `poll(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PollWait;

impl ReadinessWait for PollWait {
    fn wait(&mut self, fds: &mut [libc::pollfd], timeout_ms: libc::c_int) -> io::Result<usize> {
        // SAFETY: `fds` is a live, initialised slice of `len()` pollfd
        // entries for the whole call.
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if ready < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ready as usize)
    }
}

/// Runs until `stop` is set or the readiness wait itself fails.
///
/// Every datagram read is handed to `on_datagram` along with the index of
/// the socket it came from. A read error on one socket is logged and counted
/// but does not end the session.
pub fn run_receive_loop<S, F>(
    sockets: &RawSocketSet<S>,
    stop: &StopEvent,
    config: &ReceiveConfig,
    on_datagram: F,
) -> Result<ReceiveStats, ReceiveError>
where
    S: DatagramSource,
    F: FnMut(usize, &[u8]),
{
    run_receive_loop_with(sockets, stop, config, &mut PollWait, on_datagram)
}

/// [`run_receive_loop`] with the readiness wait supplied by the caller.
pub fn run_receive_loop_with<S, W, F>(
    sockets: &RawSocketSet<S>,
    stop: &StopEvent,
    config: &ReceiveConfig,
    waiter: &mut W,
    mut on_datagram: F,
) -> Result<ReceiveStats, ReceiveError>
where
    S: DatagramSource,
    W: ReadinessWait + ?Sized,
    F: FnMut(usize, &[u8]),
{
    if sockets.is_empty() {
        return Err(ReceiveError::EmptySet);
    }

    let timeout_ms = libc::c_int::try_from(config.timeout.as_millis()).unwrap_or(libc::c_int::MAX);
    let mut poll_fds: Vec<libc::pollfd> = sockets
        .iter()
        .map(|socket| libc::pollfd {
            fd: socket.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let mut buffer = vec![0u8; config.buffer_size.max(1)];
    let mut stats = ReceiveStats::default();

    info!(
        "receive loop started on {} sockets (timeout {:?})",
        sockets.len(),
        config.timeout
    );

    loop {
        stats.stop_checks += 1;
        if stop.is_set() {
            break;
        }
        stats.iterations += 1;

        for poll_fd in poll_fds.iter_mut() {
            poll_fd.revents = 0;
        }

        let ready = match waiter.wait(&mut poll_fds, timeout_ms) {
            Ok(ready) => ready,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                stats.interrupts += 1;
                continue;
            }
            Err(e) => {
                error!("readiness wait failed, ending receive session: {e}");
                return Err(ReceiveError::Wait(e));
            }
        };

        if ready == 0 {
            stats.timeouts += 1;
            continue;
        }

        for (index, (socket, poll_fd)) in sockets.iter().zip(poll_fds.iter_mut()).enumerate() {
            if poll_fd.revents & libc::POLLNVAL != 0 {
                // a negative fd is skipped by poll, so this socket stops
                // waking every wait immediately
                warn!("socket {index} is not an open descriptor, no longer waiting on it");
                poll_fd.fd = -1;
                stats.invalid_handles += 1;
                continue;
            }
            if poll_fd.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) == 0 {
                continue;
            }

            match socket.recv_datagram(&mut buffer) {
                Ok(0) => {}
                Ok(len) => {
                    debug!("received {len} bytes on socket {index}");
                    stats.datagrams += 1;
                    stats.bytes += len as u64;
                    on_datagram(index, &buffer[..len]);
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    warn!("recv on socket {index} failed: {e}");
                    stats.read_errors += 1;
                }
            }
        }
    }

    info!(
        "receive loop stopped after {} iterations: {} datagrams, {} bytes, {} read errors",
        stats.iterations, stats.datagrams, stats.bytes, stats.read_errors
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::net::UdpSocket;
    use std::os::fd::{AsRawFd, RawFd};
    use std::os::unix::thread::JoinHandleExt;
    use std::sync::Once;
    use std::thread;
    use std::time::Instant;

    fn udp() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        socket
    }

    fn udp_set(count: usize) -> RawSocketSet<UdpSocket> {
        RawSocketSet::from_sockets((0..count).map(|_| udp()).collect())
    }

    fn config(timeout_ms: u64) -> ReceiveConfig {
        ReceiveConfig {
            timeout: Duration::from_millis(timeout_ms),
            ..Default::default()
        }
    }

    /// Drains the datagram like a real socket but reports a hard error.
    struct FailingSource(UdpSocket);

    impl AsRawFd for FailingSource {
        fn as_raw_fd(&self) -> RawFd {
            self.0.as_raw_fd()
        }
    }

    impl DatagramSource for FailingSource {
        fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.recv(buf)?;
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "injected"))
        }
    }

    #[test]
    fn stop_set_before_start_exits_without_waiting() {
        let sockets = udp_set(3);
        let stop = StopEvent::new();
        stop.set();

        let started = Instant::now();
        let mut calls = 0;
        let stats = run_receive_loop(&sockets, &stop, &config(1000), |_, _| calls += 1).unwrap();

        assert_eq!(calls, 0);
        assert_eq!(stats.iterations, 0);
        assert_eq!(stats.stop_checks, 1);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn delayed_datagram_on_second_socket_then_stop() {
        let sockets = udp_set(3);
        let target = sockets.get(1).unwrap().local_addr().unwrap();
        let stop = StopEvent::new();
        let timeout = Duration::from_millis(500);

        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            let out = UdpSocket::bind("127.0.0.1:0").unwrap();
            out.send_to(&[7u8; 33], target).unwrap();
        });

        let started = Instant::now();
        let mut received = Vec::new();
        let stats = run_receive_loop(
            &sockets,
            &stop,
            &ReceiveConfig {
                timeout,
                ..Default::default()
            },
            |index, data| {
                received.push((index, data.to_vec()));
                stop.set();
            },
        )
        .unwrap();
        sender.join().unwrap();

        assert_eq!(received, vec![(1, vec![7u8; 33])]);
        // the draining iteration was the last one, followed by one final check
        assert_eq!(stats.stop_checks, stats.iterations + 1);
        assert_eq!(stats.iterations, stats.timeouts + stats.interrupts + 1);
        assert!(started.elapsed() < Duration::from_millis(100) + timeout * 2);
    }

    #[test]
    fn stop_from_another_thread_is_seen_within_one_timeout() {
        let sockets = udp_set(2);
        let stop = StopEvent::new();
        let controller = stop.clone();
        let timeout = Duration::from_millis(100);

        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(250));
            controller.set();
            Instant::now()
        });

        let stats = run_receive_loop(&sockets, &stop, &config(100), |_, _| {}).unwrap();
        let stopped_at = Instant::now();
        let set_at = stopper.join().unwrap();

        assert!(stats.timeouts >= 2);
        assert_eq!(stats.datagrams, 0);
        assert!(stopped_at.duration_since(set_at) <= timeout * 3);
    }

    #[test]
    fn failing_socket_does_not_block_the_others() {
        let failing = udp();
        let healthy = udp();
        let failing_addr = failing.local_addr().unwrap();
        let healthy_addr = healthy.local_addr().unwrap();

        // mixed sources in one set
        enum Source {
            Failing(FailingSource),
            Healthy(UdpSocket),
        }
        impl AsRawFd for Source {
            fn as_raw_fd(&self) -> RawFd {
                match self {
                    Source::Failing(s) => s.as_raw_fd(),
                    Source::Healthy(s) => s.as_raw_fd(),
                }
            }
        }
        impl DatagramSource for Source {
            fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<usize> {
                match self {
                    Source::Failing(s) => s.recv_datagram(buf),
                    Source::Healthy(s) => s.recv_datagram(buf),
                }
            }
        }

        let sockets = RawSocketSet::from_sockets(vec![
            Source::Failing(FailingSource(failing)),
            Source::Healthy(healthy),
        ]);
        let out = UdpSocket::bind("127.0.0.1:0").unwrap();
        out.send_to(b"to the broken one", failing_addr).unwrap();
        out.send_to(b"hello", healthy_addr).unwrap();

        let stop = StopEvent::new();
        let mut received = Vec::new();
        let stats = run_receive_loop(&sockets, &stop, &config(500), |index, data| {
            received.push((index, data.to_vec()));
            stop.set();
        })
        .unwrap();

        assert_eq!(received, vec![(1, b"hello".to_vec())]);
        assert_eq!(stats.read_errors, 1);
    }

    #[test]
    fn every_ready_socket_is_drained_once_in_order() {
        let sockets = udp_set(3);
        let out = UdpSocket::bind("127.0.0.1:0").unwrap();
        for (i, socket) in sockets.iter().enumerate().rev() {
            out.send_to(&[i as u8], socket.local_addr().unwrap()).unwrap();
        }
        // let all three datagrams land before the first wait
        thread::sleep(Duration::from_millis(50));

        let stop = StopEvent::new();
        let mut order = Vec::new();
        run_receive_loop(&sockets, &stop, &config(200), |index, data| {
            assert_eq!(data, &[index as u8]);
            order.push(index);
            if order.len() == 3 {
                stop.set();
            }
        })
        .unwrap();

        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn oversized_datagrams_are_truncated_to_the_buffer() {
        let sockets = udp_set(1);
        let out = UdpSocket::bind("127.0.0.1:0").unwrap();
        out.send_to(&[1u8; 64], sockets.get(0).unwrap().local_addr().unwrap())
            .unwrap();

        let stop = StopEvent::new();
        let mut lengths = Vec::new();
        let cfg = ReceiveConfig {
            timeout: Duration::from_millis(500),
            buffer_size: 16,
        };
        run_receive_loop(&sockets, &stop, &cfg, |_, data| {
            lengths.push(data.len());
            stop.set();
        })
        .unwrap();

        assert_eq!(lengths, vec![16]);
    }

    #[test]
    fn empty_set_is_rejected() {
        let sockets: RawSocketSet<UdpSocket> = RawSocketSet::from_sockets(Vec::new());
        let result = run_receive_loop(&sockets, &StopEvent::new(), &config(10), |_, _| {});
        assert!(matches!(result, Err(ReceiveError::EmptySet)));
    }

    /// Plays back a fixed sequence of wait outcomes. `Ok` entries carry the
    /// `revents` for each descriptor. Every call records the fds it saw.
    struct ScriptedWait {
        script: VecDeque<io::Result<Vec<libc::c_short>>>,
        seen: Vec<Vec<RawFd>>,
    }

    impl ScriptedWait {
        fn new(script: Vec<io::Result<Vec<libc::c_short>>>) -> Self {
            ScriptedWait {
                script: script.into(),
                seen: Vec::new(),
            }
        }
    }

    impl ReadinessWait for ScriptedWait {
        fn wait(&mut self, fds: &mut [libc::pollfd], _timeout_ms: libc::c_int) -> io::Result<usize> {
            self.seen.push(fds.iter().map(|fd| fd.fd).collect());
            let revents = self
                .script
                .pop_front()
                .unwrap_or_else(|| Err(io::Error::other("script exhausted")))?;
            let mut ready = 0;
            for (fd, revents) in fds.iter_mut().zip(revents) {
                if fd.fd >= 0 && revents != 0 {
                    fd.revents = revents;
                    ready += 1;
                }
            }
            Ok(ready)
        }
    }

    fn interrupted() -> io::Error {
        io::Error::from_raw_os_error(libc::EINTR)
    }

    #[test]
    fn interrupted_waits_are_retried_until_a_fatal_failure() {
        let sockets = udp_set(2);
        let mut waiter = ScriptedWait::new(vec![
            Err(interrupted()),
            Ok(vec![0, 0]),
            Err(interrupted()),
            Err(io::Error::from_raw_os_error(libc::EINVAL)),
        ]);

        let result = run_receive_loop_with(&sockets, &StopEvent::new(), &config(10), &mut waiter, |_, _| {
            panic!("nothing should be read")
        });

        match result {
            Err(ReceiveError::Wait(e)) => assert_eq!(e.raw_os_error(), Some(libc::EINVAL)),
            other => panic!("expected a wait failure, got {other:?}"),
        }
        assert_eq!(waiter.seen.len(), 4);
        assert!(waiter.script.is_empty());
    }

    #[test]
    fn interrupted_wait_then_stop_counts_the_retry() {
        let sockets = udp_set(1);
        let stop = StopEvent::new();
        let out = UdpSocket::bind("127.0.0.1:0").unwrap();
        out.send_to(b"x", sockets.get(0).unwrap().local_addr().unwrap())
            .unwrap();
        thread::sleep(Duration::from_millis(20));

        let mut waiter = ScriptedWait::new(vec![Err(interrupted()), Ok(vec![libc::POLLIN])]);
        let stats = run_receive_loop_with(&sockets, &stop, &config(10), &mut waiter, |_, _| stop.set())
            .unwrap();

        assert_eq!(stats.interrupts, 1);
        assert_eq!(stats.iterations, 2);
        assert_eq!(stats.datagrams, 1);
    }

    #[test]
    fn invalid_handle_is_dropped_from_the_wait_set() {
        let sockets = udp_set(2);
        let fds: Vec<RawFd> = sockets.iter().map(|s| s.as_raw_fd()).collect();
        let stop = StopEvent::new();
        let out = UdpSocket::bind("127.0.0.1:0").unwrap();
        out.send_to(b"ok", sockets.get(1).unwrap().local_addr().unwrap())
            .unwrap();
        thread::sleep(Duration::from_millis(20));

        let mut waiter = ScriptedWait::new(vec![
            Ok(vec![libc::POLLNVAL, 0]),
            Ok(vec![libc::POLLNVAL, libc::POLLIN]),
        ]);
        let mut received = Vec::new();
        let stats = run_receive_loop_with(&sockets, &stop, &config(10), &mut waiter, |index, data| {
            received.push((index, data.to_vec()));
            stop.set();
        })
        .unwrap();

        assert_eq!(waiter.seen, vec![fds.clone(), vec![-1, fds[1]]]);
        assert_eq!(stats.invalid_handles, 1);
        assert_eq!(received, vec![(1, b"ok".to_vec())]);
    }

    extern "C" fn ignore_signal(_signal: libc::c_int) {}

    fn install_sigusr1_without_restart() {
        static INSTALL: Once = Once::new();
        INSTALL.call_once(|| {
            // SAFETY: the handler does nothing, and the zeroed sigaction is
            // fully initialised before it is passed in.
            unsafe {
                let mut action: libc::sigaction = std::mem::zeroed();
                action.sa_sigaction = ignore_signal as *const () as libc::sighandler_t;
                action.sa_flags = 0;
                libc::sigemptyset(&mut action.sa_mask);
                assert_eq!(libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut()), 0);
            }
        });
    }

    #[test]
    fn signal_during_poll_is_retried() {
        install_sigusr1_without_restart();
        let stop = StopEvent::new();
        let controller = stop.clone();

        let worker = thread::spawn(move || {
            let sockets = udp_set(2);
            run_receive_loop(&sockets, &stop, &config(1000), |_, _| {})
        });

        // keep signalling so at least one lands while the worker is in poll
        for _ in 0..10 {
            thread::sleep(Duration::from_millis(30));
            // SAFETY: the worker has not been joined, so its pthread_t is live.
            unsafe {
                libc::pthread_kill(worker.as_pthread_t(), libc::SIGUSR1);
            }
        }
        controller.set();

        let started = Instant::now();
        let stats = worker.join().unwrap().unwrap();
        assert!(stats.interrupts >= 1, "{stats:?}");
        assert_eq!(stats.iterations, stats.timeouts + stats.interrupts);
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
