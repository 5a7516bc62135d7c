//! Splits an address list into provider-sized batches.

/// An ordered slice of the input addresses sent in one provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Position of this chunk within the dispatch
    pub index: usize,
    /// Position of the chunk's first address within the input list
    pub offset: usize,
    pub addresses: Vec<String>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// Where a chunk ended up once its dispatch or redrive finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkFate {
    /// The provider answered; outcomes are per address
    Delivered,
    /// Inline retries gave up and the chunk waits in the retry queue
    RetryQueued,
    /// A queued chunk was accepted on redrive
    RedrivenSuccess,
    /// A queued chunk failed another redrive and went back to the tail
    Requeued,
    /// A queued chunk ran out of redrives
    DeadLettered,
    /// Every address left in a queued chunk is permanently invalid
    Retired,
}

/// Partition `addresses` into chunks of at most `max_size`.
///
/// Order and multiplicity are preserved; deduplication is the caller's job.
/// A `max_size` of zero is treated as one.
pub fn partition(addresses: &[String], max_size: usize) -> Vec<Chunk> {
    let size = max_size.max(1);
    addresses
        .chunks(size)
        .enumerate()
        .map(|(index, slice)| Chunk {
            index,
            offset: index * size,
            addresses: slice.to_vec(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addresses(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("token-{i}")).collect()
    }

    #[test]
    fn test_empty_input_yields_no_chunks() {
        assert!(partition(&[], 500).is_empty());
    }

    #[test]
    fn test_chunk_count_is_ceiling() {
        for (len, size, expected) in [(1200, 500, 3), (1000, 500, 2), (1, 500, 1), (7, 3, 3)] {
            let chunks = partition(&addresses(len), size);
            assert_eq!(chunks.len(), expected, "len={len} size={size}");
            assert!(chunks.iter().all(|c| c.len() <= size));
        }
    }

    #[test]
    fn test_order_and_offsets_preserved() {
        let input = addresses(1200);
        let chunks = partition(&input, 500);

        assert_eq!(chunks[0].offset, 0);
        assert_eq!(chunks[1].offset, 500);
        assert_eq!(chunks[2].offset, 1000);
        assert_eq!(chunks[2].len(), 200);

        let flattened: Vec<String> = chunks.into_iter().flat_map(|c| c.addresses).collect();
        assert_eq!(flattened, input);
    }

    #[test]
    fn test_duplicates_are_kept() {
        let input = vec!["a".to_string(), "a".to_string(), "b".to_string()];
        let chunks = partition(&input, 2);
        assert_eq!(chunks[0].addresses, vec!["a", "a"]);
        assert_eq!(chunks[1].addresses, vec!["b"]);
    }

    #[test]
    fn test_zero_size_treated_as_one() {
        let chunks = partition(&addresses(3), 0);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].offset, 2);
    }
}
