use std::{
    io,
    net::{SocketAddr, TcpListener, TcpStream},
    thread,
    time::{Duration, Instant},
};

use log::{debug, info};

use crate::{
    error::{CollectiveErr, Result},
    msg::{
        self, Command, read_barrier, read_control, read_tensor_into, write_barrier, write_control,
        write_tensor,
    },
};

const ACCEPT_POLL: Duration = Duration::from_millis(10);
const CONNECT_RETRY: Duration = Duration::from_millis(50);

/// Identity and rendezvous parameters for one cohort member.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    pub rank: usize,
    pub world_size: usize,
    pub rendezvous: SocketAddr,
    pub timeout: Duration,
}

#[derive(Debug)]
enum Links {
    /// Single-member cohort, every collective is local.
    Solo,
    /// Rank 0: one stream per peer, indexed by `peer_rank - 1`.
    Coordinator(Vec<TcpStream>),
    /// Any other rank: the stream to rank 0.
    Peer(TcpStream),
}

/// A fixed cohort of workers with blocking collectives over a star topology.
///
/// Rank 0 is the reduction root: it sums peer tensors in rank order and
/// broadcasts the result, so every member receives a bit-identical buffer.
/// All operations block until the whole cohort participates; a member that
/// never arrives stalls the others indefinitely (no steady-state timeout).
#[derive(Debug)]
pub struct ProcessGroup {
    rank: usize,
    world_size: usize,
    links: Links,
    scratch: Vec<f32>,
}

impl ProcessGroup {
    /// Establishes the cohort.
    ///
    /// Rank 0 binds the rendezvous address and accepts `world_size - 1`
    /// joins; every other rank connects and handshakes. Returns only once
    /// the whole cohort is present (the bootstrap doubles as a barrier).
    ///
    /// # Errors
    /// `RankOutOfRange`/`EmptyCohort` on invalid identity,
    /// `RendezvousTimeout` when the cohort does not form within
    /// `cfg.timeout`, `Io` on transport failures.
    pub fn bootstrap(cfg: &GroupConfig) -> Result<Self> {
        if cfg.world_size == 0 {
            return Err(CollectiveErr::EmptyCohort);
        }
        if cfg.rank >= cfg.world_size {
            return Err(CollectiveErr::RankOutOfRange {
                rank: cfg.rank,
                world_size: cfg.world_size,
            });
        }

        let links = if cfg.world_size == 1 {
            Links::Solo
        } else if cfg.rank == 0 {
            Links::Coordinator(accept_peers(cfg)?)
        } else {
            Links::Peer(join(cfg)?)
        };

        info!(rank = cfg.rank, world_size = cfg.world_size; "process group established");

        Ok(Self {
            rank: cfg.rank,
            world_size: cfg.world_size,
            links,
            scratch: Vec::new(),
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Whether this member is the designated coordinator (rank 0).
    ///
    /// Gates all logging and checkpoint I/O in the training loop.
    pub fn is_coordinator(&self) -> bool {
        self.rank == 0
    }

    /// Averages `buf` elementwise across the cohort, in place.
    ///
    /// Blocking: every member must call this with a buffer of the same
    /// length. On return every member holds the same averaged values.
    pub fn all_reduce_mean(&mut self, buf: &mut [f32]) -> Result<()> {
        match &mut self.links {
            Links::Solo => Ok(()),
            Links::Peer(stream) => {
                write_tensor(stream, buf)?;
                read_tensor_into(stream, buf)
            }
            Links::Coordinator(peers) => {
                self.scratch.resize(buf.len(), 0.0);
                for stream in peers.iter_mut() {
                    read_tensor_into(stream, &mut self.scratch)?;
                    for (acc, x) in buf.iter_mut().zip(&self.scratch) {
                        *acc += x;
                    }
                }

                let inv = 1.0 / self.world_size as f32;
                for acc in buf.iter_mut() {
                    *acc *= inv;
                }

                for stream in peers.iter_mut() {
                    write_tensor(stream, buf)?;
                }
                Ok(())
            }
        }
    }

    /// Replaces every member's `buf` with rank 0's contents.
    pub fn broadcast(&mut self, buf: &mut [f32]) -> Result<()> {
        match &mut self.links {
            Links::Solo => Ok(()),
            Links::Peer(stream) => read_tensor_into(stream, buf),
            Links::Coordinator(peers) => {
                for stream in peers.iter_mut() {
                    write_tensor(stream, buf)?;
                }
                Ok(())
            }
        }
    }

    /// Blocks until every cohort member has entered the barrier.
    pub fn barrier(&mut self) -> Result<()> {
        match &mut self.links {
            Links::Solo => Ok(()),
            Links::Peer(stream) => {
                write_barrier(stream)?;
                read_barrier(stream)
            }
            Links::Coordinator(peers) => {
                for stream in peers.iter_mut() {
                    read_barrier(stream)?;
                }
                for stream in peers.iter_mut() {
                    write_barrier(stream)?;
                }
                Ok(())
            }
        }
    }
}

/// Rank-0 side of the rendezvous.
fn accept_peers(cfg: &GroupConfig) -> Result<Vec<TcpStream>> {
    let deadline = Instant::now() + cfg.timeout;
    let timed_out = || CollectiveErr::RendezvousTimeout {
        addr: cfg.rendezvous,
        timeout: cfg.timeout,
    };

    let listener = TcpListener::bind(cfg.rendezvous)?;
    listener.set_nonblocking(true)?;

    let mut peers: Vec<Option<TcpStream>> = (1..cfg.world_size).map(|_| None).collect();
    let mut joined = 0;

    while joined < peers.len() {
        let mut stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(timed_out());
                }
                thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(deadline.saturating_duration_since(Instant::now()).max(ACCEPT_POLL)))?;

        let rank = match read_control(&mut stream)? {
            Command::Join { rank } => rank,
            Command::Welcome { .. } => {
                return Err(CollectiveErr::UnexpectedFrame {
                    got: msg::KIND_CONTROL,
                    expected: "join",
                });
            }
        };

        if rank == 0 || rank >= cfg.world_size {
            return Err(CollectiveErr::RankOutOfRange {
                rank,
                world_size: cfg.world_size,
            });
        }

        let slot = &mut peers[rank - 1];
        if slot.is_some() {
            return Err(CollectiveErr::DuplicateRank { rank });
        }

        write_control(
            &mut stream,
            &Command::Welcome {
                world_size: cfg.world_size,
            },
        )?;

        debug!(rank = rank; "peer joined rendezvous");
        *slot = Some(stream);
        joined += 1;
    }

    let mut streams = Vec::with_capacity(peers.len());
    for slot in peers {
        // SAFETY: the loop above only exits once every slot is filled.
        let stream = slot.unwrap();
        stream.set_read_timeout(None)?;
        write_barrier(&mut &stream)?;
        streams.push(stream);
    }

    Ok(streams)
}

/// Non-zero-rank side of the rendezvous.
fn join(cfg: &GroupConfig) -> Result<TcpStream> {
    let deadline = Instant::now() + cfg.timeout;
    let timed_out = || CollectiveErr::RendezvousTimeout {
        addr: cfg.rendezvous,
        timeout: cfg.timeout,
    };

    let mut stream = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(timed_out());
        }

        match TcpStream::connect_timeout(&cfg.rendezvous, remaining) {
            Ok(stream) => break stream,
            Err(_) => thread::sleep(CONNECT_RETRY),
        }
    };

    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(deadline.saturating_duration_since(Instant::now()).max(CONNECT_RETRY)))?;

    write_control(&mut stream, &Command::Join { rank: cfg.rank })?;

    match read_control(&mut stream)? {
        Command::Welcome { world_size } if world_size == cfg.world_size => {}
        Command::Welcome { world_size } => {
            return Err(CollectiveErr::WorldSizeMismatch {
                got: world_size,
                expected: cfg.world_size,
            });
        }
        Command::Join { .. } => {
            return Err(CollectiveErr::UnexpectedFrame {
                got: msg::KIND_CONTROL,
                expected: "welcome",
            });
        }
    }

    // Released once the whole cohort has joined.
    read_barrier(&mut stream)?;
    stream.set_read_timeout(None)?;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reserves a loopback address for a test cohort.
    fn free_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    fn cfg(rank: usize, world_size: usize, rendezvous: SocketAddr) -> GroupConfig {
        GroupConfig {
            rank,
            world_size,
            rendezvous,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn solo_collectives_are_local_noops() {
        let addr = free_addr();
        let mut group = ProcessGroup::bootstrap(&cfg(0, 1, addr)).unwrap();

        let mut buf = [1.0f32, 2.0, 3.0];
        group.all_reduce_mean(&mut buf).unwrap();
        assert_eq!(buf, [1.0, 2.0, 3.0]);

        group.broadcast(&mut buf).unwrap();
        group.barrier().unwrap();
        assert!(group.is_coordinator());
    }

    #[test]
    fn rank_out_of_range_is_fatal() {
        let addr = free_addr();
        let err = ProcessGroup::bootstrap(&cfg(2, 2, addr)).unwrap_err();
        assert!(matches!(
            err,
            CollectiveErr::RankOutOfRange { rank: 2, world_size: 2 }
        ));

        let err = ProcessGroup::bootstrap(&cfg(0, 0, addr)).unwrap_err();
        assert!(matches!(err, CollectiveErr::EmptyCohort));
    }

    #[test]
    fn unreachable_rendezvous_times_out() {
        let addr = free_addr();
        let mut cfg = cfg(1, 2, addr);
        cfg.timeout = Duration::from_millis(300);

        let err = ProcessGroup::bootstrap(&cfg).unwrap_err();
        assert!(matches!(err, CollectiveErr::RendezvousTimeout { .. }));
    }

    #[test]
    fn two_ranks_all_reduce_to_the_same_mean() {
        let addr = free_addr();

        let coordinator = thread::spawn(move || {
            let mut group = ProcessGroup::bootstrap(&cfg(0, 2, addr)).unwrap();
            let mut buf = [1.0f32, -4.0, 10.0];
            group.all_reduce_mean(&mut buf).unwrap();
            buf
        });

        let peer = thread::spawn(move || {
            let mut group = ProcessGroup::bootstrap(&cfg(1, 2, addr)).unwrap();
            let mut buf = [3.0f32, 4.0, -10.0];
            group.all_reduce_mean(&mut buf).unwrap();
            buf
        });

        let a = coordinator.join().unwrap();
        let b = peer.join().unwrap();
        assert_eq!(a, [2.0, 0.0, 0.0]);
        assert_eq!(a, b, "cohort members must hold bit-identical results");
    }

    #[test]
    fn broadcast_replaces_peer_buffers() {
        let addr = free_addr();

        let coordinator = thread::spawn(move || {
            let mut group = ProcessGroup::bootstrap(&cfg(0, 3, addr)).unwrap();
            let mut buf = [0.5f32, 1.5];
            group.broadcast(&mut buf).unwrap();
            group.barrier().unwrap();
            buf
        });

        let peers: Vec<_> = (1..3)
            .map(|rank| {
                thread::spawn(move || {
                    let mut group = ProcessGroup::bootstrap(&cfg(rank, 3, addr)).unwrap();
                    let mut buf = [f32::NAN, f32::NAN];
                    group.broadcast(&mut buf).unwrap();
                    group.barrier().unwrap();
                    buf
                })
            })
            .collect();

        let root = coordinator.join().unwrap();
        for peer in peers {
            assert_eq!(peer.join().unwrap(), root);
        }
    }
}
