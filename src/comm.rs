//! The message-passing substrate behind every collective operation.
//!
//! The forest algorithms are written against the [`Communicator`] trait.
//! [`NullCommunicator`] is the degenerate single-process instance in which
//! every collective reduces to the identity; the `mpi` feature provides an
//! rsmpi-backed implementation for distributed runs.

use thiserror::Error;

/// A failure in the messaging substrate. Fatal for the forest: the caller
/// may only destroy it afterwards.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("collective operation failed: {0}")]
    Collective(String),
    #[error("point-to-point message failed: {0}")]
    PointToPoint(String),
}

/// The collective and point-to-point primitives the forest consumes.
///
/// Rank order is significant everywhere: gathers return contributions in
/// rank order and the exclusive scan runs over ranks ascending.
pub trait Communicator {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn barrier(&self) -> Result<(), TransportError>;

    fn all_reduce_sum_i64(&self, value: i64) -> Result<i64, TransportError>;

    fn all_reduce_max_i64(&self, value: i64) -> Result<i64, TransportError>;

    fn all_reduce_or(&self, value: bool) -> Result<bool, TransportError>;

    /// Sum of the values on all lower ranks; zero on rank 0.
    fn exclusive_scan_sum_i64(&self, value: i64) -> Result<i64, TransportError>;

    fn all_gather_i64(&self, value: i64) -> Result<Vec<i64>, TransportError>;

    /// Concatenation of every rank's equally long slice, in rank order.
    fn all_gather_i64_slice(&self, values: &[i64]) -> Result<Vec<i64>, TransportError>;

    fn broadcast_bytes(&self, root: usize, buffer: &mut Vec<u8>) -> Result<(), TransportError>;

    /// `Some` with the per-rank streams in rank order on the root, `None`
    /// elsewhere.
    fn gather_bytes_at_root(&self, bytes: &[u8]) -> Result<Option<Vec<Vec<u8>>>, TransportError>;

    fn send_bytes(&self, dest: usize, tag: u16, bytes: &[u8]) -> Result<(), TransportError>;

    fn recv_bytes(&self, source: usize, tag: u16) -> Result<Vec<u8>, TransportError>;

    /// Pair-wise exchange with peers known on both sides: posts all sends
    /// without blocking, receives the `incoming` messages in order, then
    /// completes the sends. Returns the received blobs in `incoming`
    /// order.
    fn exchange_bytes(
        &self,
        outgoing: &[(usize, u16, Vec<u8>)],
        incoming: &[(usize, u16)],
    ) -> Result<Vec<Vec<u8>>, TransportError>;
}

/// The single-process communicator. All collectives are the identity and
/// point-to-point traffic is a contract violation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCommunicator;

impl NullCommunicator {
    pub fn new() -> NullCommunicator {
        NullCommunicator
    }
}

impl Communicator for NullCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn all_reduce_sum_i64(&self, value: i64) -> Result<i64, TransportError> {
        Ok(value)
    }

    fn all_reduce_max_i64(&self, value: i64) -> Result<i64, TransportError> {
        Ok(value)
    }

    fn all_reduce_or(&self, value: bool) -> Result<bool, TransportError> {
        Ok(value)
    }

    fn exclusive_scan_sum_i64(&self, _value: i64) -> Result<i64, TransportError> {
        Ok(0)
    }

    fn all_gather_i64(&self, value: i64) -> Result<Vec<i64>, TransportError> {
        Ok(vec![value])
    }

    fn all_gather_i64_slice(&self, values: &[i64]) -> Result<Vec<i64>, TransportError> {
        Ok(values.to_vec())
    }

    fn broadcast_bytes(&self, root: usize, _buffer: &mut Vec<u8>) -> Result<(), TransportError> {
        if root != 0 {
            return Err(TransportError::Collective(format!(
                "invalid root {} in a single-process run",
                root
            )));
        }
        Ok(())
    }

    fn gather_bytes_at_root(&self, bytes: &[u8]) -> Result<Option<Vec<Vec<u8>>>, TransportError> {
        Ok(Some(vec![bytes.to_vec()]))
    }

    fn send_bytes(&self, dest: usize, _tag: u16, _bytes: &[u8]) -> Result<(), TransportError> {
        Err(TransportError::PointToPoint(format!(
            "no peer {} in a single-process run",
            dest
        )))
    }

    fn recv_bytes(&self, source: usize, _tag: u16) -> Result<Vec<u8>, TransportError> {
        Err(TransportError::PointToPoint(format!(
            "no peer {} in a single-process run",
            source
        )))
    }

    fn exchange_bytes(
        &self,
        outgoing: &[(usize, u16, Vec<u8>)],
        incoming: &[(usize, u16)],
    ) -> Result<Vec<Vec<u8>>, TransportError> {
        if !outgoing.is_empty() || !incoming.is_empty() {
            return Err(TransportError::PointToPoint(
                "no peers in a single-process run".to_string(),
            ));
        }
        Ok(Vec::new())
    }
}

#[cfg(feature = "mpi")]
pub use self::mpi_backend::MpiCommunicator;

#[cfg(feature = "mpi")]
mod mpi_backend {
    use mpi::collective::SystemOperation;
    use mpi::environment::Universe;
    use mpi::traits::*;

    use super::TransportError;
    use super::Communicator as ForestCommunicator;

    /// World communicator backed by rsmpi. Owns the MPI environment; MPI
    /// is finalized when the communicator is dropped.
    pub struct MpiCommunicator {
        universe: Universe,
    }

    impl MpiCommunicator {
        /// Initialize MPI and wrap the world communicator. Returns `None`
        /// when MPI was already initialized.
        pub fn new() -> Option<MpiCommunicator> {
            mpi::initialize().map(|universe| MpiCommunicator { universe })
        }
    }

    impl ForestCommunicator for MpiCommunicator {
        fn rank(&self) -> usize {
            self.universe.world().rank() as usize
        }

        fn size(&self) -> usize {
            self.universe.world().size() as usize
        }

        fn barrier(&self) -> Result<(), TransportError> {
            self.universe.world().barrier();
            Ok(())
        }

        fn all_reduce_sum_i64(&self, value: i64) -> Result<i64, TransportError> {
            let mut result = 0i64;
            self.universe
                .world()
                .all_reduce_into(&value, &mut result, SystemOperation::sum());
            Ok(result)
        }

        fn all_reduce_max_i64(&self, value: i64) -> Result<i64, TransportError> {
            let mut result = 0i64;
            self.universe
                .world()
                .all_reduce_into(&value, &mut result, SystemOperation::max());
            Ok(result)
        }

        fn all_reduce_or(&self, value: bool) -> Result<bool, TransportError> {
            let mut result = 0i32;
            self.universe.world().all_reduce_into(
                &(value as i32),
                &mut result,
                SystemOperation::max(),
            );
            Ok(result != 0)
        }

        fn exclusive_scan_sum_i64(&self, value: i64) -> Result<i64, TransportError> {
            // MPI leaves the rank-0 result undefined for an exclusive scan.
            let mut result = 0i64;
            self.universe
                .world()
                .exclusive_scan_into(&value, &mut result, SystemOperation::sum());
            if self.rank() == 0 {
                result = 0;
            }
            Ok(result)
        }

        fn all_gather_i64(&self, value: i64) -> Result<Vec<i64>, TransportError> {
            let mut result = vec![0i64; self.size()];
            self.universe.world().all_gather_into(&value, &mut result[..]);
            Ok(result)
        }

        fn all_gather_i64_slice(&self, values: &[i64]) -> Result<Vec<i64>, TransportError> {
            let mut result = vec![0i64; values.len() * self.size()];
            self.universe.world().all_gather_into(values, &mut result[..]);
            Ok(result)
        }

        fn broadcast_bytes(&self, root: usize, buffer: &mut Vec<u8>) -> Result<(), TransportError> {
            let world = self.universe.world();
            let root_process = world.process_at_rank(root as i32);
            let mut len = buffer.len() as u64;
            root_process.broadcast_into(&mut len);
            buffer.resize(len as usize, 0);
            if len > 0 {
                root_process.broadcast_into(&mut buffer[..]);
            }
            Ok(())
        }

        fn gather_bytes_at_root(
            &self,
            bytes: &[u8],
        ) -> Result<Option<Vec<Vec<u8>>>, TransportError> {
            const GATHER_TAG: i32 = 0x7f;
            let world = self.universe.world();
            let counts = self.all_gather_i64(bytes.len() as i64)?;
            if self.rank() == 0 {
                let mut streams = Vec::with_capacity(self.size());
                streams.push(bytes.to_vec());
                for source in 1..self.size() {
                    if counts[source] == 0 {
                        streams.push(Vec::new());
                        continue;
                    }
                    let (data, _status) = world
                        .process_at_rank(source as i32)
                        .receive_vec_with_tag::<u8>(GATHER_TAG);
                    streams.push(data);
                }
                Ok(Some(streams))
            } else {
                if !bytes.is_empty() {
                    world.process_at_rank(0).send_with_tag(bytes, GATHER_TAG);
                }
                Ok(None)
            }
        }

        fn send_bytes(&self, dest: usize, tag: u16, bytes: &[u8]) -> Result<(), TransportError> {
            self.universe
                .world()
                .process_at_rank(dest as i32)
                .send_with_tag(bytes, tag as i32);
            Ok(())
        }

        fn recv_bytes(&self, source: usize, tag: u16) -> Result<Vec<u8>, TransportError> {
            let (data, _status) = self
                .universe
                .world()
                .process_at_rank(source as i32)
                .receive_vec_with_tag::<u8>(tag as i32);
            Ok(data)
        }

        fn exchange_bytes(
            &self,
            outgoing: &[(usize, u16, Vec<u8>)],
            incoming: &[(usize, u16)],
        ) -> Result<Vec<Vec<u8>>, TransportError> {
            let world = self.universe.world();
            let mut received = Vec::with_capacity(incoming.len());
            mpi::request::scope(|scope| {
                let _pending: Vec<_> = outgoing
                    .iter()
                    .map(|(dest, tag, bytes)| {
                        mpi::request::WaitGuard::from(
                            world
                                .process_at_rank(*dest as i32)
                                .immediate_send_with_tag(scope, &bytes[..], *tag as i32),
                        )
                    })
                    .collect();
                for (source, tag) in incoming {
                    let (data, _status) = world
                        .process_at_rank(*source as i32)
                        .receive_vec_with_tag::<u8>(*tag as i32);
                    received.push(data);
                }
            });
            Ok(received)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_communicator_is_identity() {
        let comm = NullCommunicator::new();
        assert_eq!(comm.rank(), 0);
        assert_eq!(comm.size(), 1);
        assert!(comm.barrier().is_ok());
        assert_eq!(comm.all_reduce_sum_i64(42).unwrap(), 42);
        assert_eq!(comm.all_reduce_max_i64(-7).unwrap(), -7);
        assert!(comm.all_reduce_or(true).unwrap());
        assert_eq!(comm.exclusive_scan_sum_i64(42).unwrap(), 0);
        assert_eq!(comm.all_gather_i64(3).unwrap(), vec![3]);
        assert_eq!(comm.all_gather_i64_slice(&[1, 2]).unwrap(), vec![1, 2]);

        let gathered = comm.gather_bytes_at_root(b"abc").unwrap().unwrap();
        assert_eq!(gathered, vec![b"abc".to_vec()]);

        assert!(comm.exchange_bytes(&[], &[]).unwrap().is_empty());
        assert!(comm.send_bytes(1, 0, b"x").is_err());
    }
}
