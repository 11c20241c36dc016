use md5::{Digest, Md5};
use rand::Rng;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PartitionError {
    #[error("stream has no partitions")]
    NoPartitions,
}

/// Picks the partition a message goes to.
///
/// Messages with the same non-empty key always land on the same partition: the key is
/// hashed with MD5 and the first four digest bytes, read as a little-endian `i32`, are taken
/// modulo the partition count. Without a key the partition is random.
pub fn partition(partition_count: u32, partition_key: Option<&str>) -> Result<u32, PartitionError> {
    match (partition_count, partition_key) {
        (0, _) => Err(PartitionError::NoPartitions),
        (1, _) => Ok(0),
        (count, Some(key)) if !key.is_empty() => {
            let digest = Md5::digest(key.as_bytes());
            let hash = i32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
            Ok(hash.unsigned_abs() % count)
        }
        (count, _) => Ok(rand::rng().random_range(0..count)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_partitions_is_an_error() {
        assert_eq!(partition(0, Some("foo")), Err(PartitionError::NoPartitions));
    }

    #[test]
    fn single_partition_short_circuits() {
        assert_eq!(partition(1, Some("foo")), Ok(0));
        assert_eq!(partition(1, None), Ok(0));
    }

    #[test]
    fn keyed_partition_is_stable() {
        assert_eq!(partition(10, Some("foo")), Ok(2));
        assert_eq!(partition(3, Some("foo")), Ok(0));
        assert_eq!(partition(10, Some("bar")), Ok(5));
        assert_eq!(partition(10, Some("stream-key")), Ok(9));
    }

    #[test]
    fn unkeyed_partition_is_in_range() {
        for _ in 0..100 {
            assert!(partition(7, None).unwrap() < 7);
            assert!(partition(7, Some("")).unwrap() < 7);
        }
    }
}
