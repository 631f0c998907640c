//! Header matching and queue walks.

use std::collections::VecDeque;

use slab::Slab;

use super::EngineError;
use super::Msg;
use crate::request::{MatchHeader, Request, RequestId, ANY_SRC, ANY_TAG};

/// Result of a queue walk.
#[derive(Debug)]
pub(super) struct Walk<T> {
    /// Entry removed from the queue, if one matched.
    pub(super) found: Option<T>,
    /// Entries examined, the matching one included.
    pub(super) examined: usize,
}

/// Returns `true` if a message with header `hdr` satisfies a receive that
/// wants `want`, ignoring the tag bits set in `ignore`.
pub(super) fn check_match_hdr(hdr: &MatchHeader, want: &MatchHeader, ignore: u64) -> bool {
    if want.tag != ANY_TAG && (want.tag & !ignore) != (hdr.tag & !ignore) {
        return false;
    }
    if want.rank != ANY_SRC && want.rank != hdr.rank {
        return false;
    }

    want.group == hdr.group && want.count == hdr.count && want.dtype_size == hdr.dtype_size
}

/// Removes the first posted receive matching an arrived header.
pub(super) fn search_posted(
    posted: &mut VecDeque<RequestId>,
    requests: &Slab<Request>,
    hdr: &MatchHeader,
) -> Result<Walk<RequestId>, EngineError> {
    let mut examined = 0;
    let mut hit = None;
    for (pos, &id) in posted.iter().enumerate() {
        examined += 1;
        let req = requests.get(id.0).ok_or(EngineError::UnknownRequest(id))?;
        if check_match_hdr(hdr, &req.hdr, req.ignore) {
            hit = Some(pos);
            break;
        }
    }

    Ok(Walk {
        found: hit.and_then(|pos| posted.remove(pos)),
        examined,
    })
}

/// Removes the first unexpected message matching a new receive.
pub(super) fn search_unexpected(
    unexpected: &mut VecDeque<Msg>,
    want: &MatchHeader,
    ignore: u64,
) -> Walk<Msg> {
    let pos = unexpected
        .iter()
        .position(|msg| check_match_hdr(msg.hdr(), want, ignore));

    match pos {
        Some(pos) => Walk {
            found: unexpected.remove(pos),
            examined: pos + 1,
        },
        None => Walk {
            found: None,
            examined: unexpected.len(),
        },
    }
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::heap::SimAddr;
    use crate::request::{IoVec, RequestKind};

    fn hdr(tag: u64, rank: u32) -> MatchHeader {
        MatchHeader {
            count: 8,
            dtype_size: 1,
            rank,
            group: 0,
            tag,
            ..MatchHeader::default()
        }
    }

    fn recv(tag: u64, rank: u32, ignore: u64) -> Request {
        Request::new(
            RequestKind::Irecv,
            hdr(tag, rank),
            vec![IoVec::new(SimAddr::new(0x4000), 8)],
            rank,
            ignore,
        )
    }

    #[test]
    fn match_wildcards() {
        let msg = hdr(42, 3);

        assert!(check_match_hdr(&msg, &hdr(42, 3), 0));
        assert!(check_match_hdr(&msg, &hdr(ANY_TAG, 3), 0));
        assert!(check_match_hdr(&msg, &hdr(42, ANY_SRC), 0));
        assert!(check_match_hdr(&msg, &hdr(ANY_TAG, ANY_SRC), 0));
        assert!(!check_match_hdr(&msg, &hdr(43, 3), 0));
        assert!(!check_match_hdr(&msg, &hdr(42, 2), 0));
    }

    #[test]
    fn match_ignore_mask() {
        let msg = hdr(0x1234, 0);

        assert!(check_match_hdr(&msg, &hdr(0x12ff, 0), 0xff));
        assert!(!check_match_hdr(&msg, &hdr(0x13ff, 0), 0xff));
    }

    #[test]
    fn match_requires_same_shape() {
        let msg = hdr(1, 0);
        let mut want = hdr(1, 0);
        want.count = 4;
        want.dtype_size = 2;
        assert!(!check_match_hdr(&msg, &want, 0));

        let mut want = hdr(1, 0);
        want.group = 1;
        assert!(!check_match_hdr(&msg, &want, 0));
    }

    #[test]
    fn posted_walk_takes_first_match_in_order() {
        let mut requests = Slab::new();
        let a = RequestId(requests.insert(recv(7, 1, 0)));
        let b = RequestId(requests.insert(recv(ANY_TAG, ANY_SRC, 0)));
        let c = RequestId(requests.insert(recv(9, 1, 0)));
        let mut posted: VecDeque<_> = vec![a, b, c].into();

        let walk = search_posted(&mut posted, &requests, &hdr(9, 1)).unwrap();
        assert_eq!(walk.found, Some(b));
        assert_eq!(walk.examined, 2);
        assert_eq!(posted, VecDeque::from(vec![a, c]));

        let walk = search_posted(&mut posted, &requests, &hdr(5, 5)).unwrap();
        assert_eq!(walk.found, None);
        assert_eq!(walk.examined, 2);
    }

    #[test]
    fn posted_walk_matches_linear_reference() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let shape = |rng: &mut rand::rngs::StdRng| MatchHeader {
            count: [8, 16][rng.gen_range(0..2)],
            dtype_size: [1, 4][rng.gen_range(0..2)],
            rank: rng.gen_range(0..3),
            group: rng.gen_range(0..2),
            tag: rng.gen_range(0..16),
            ..MatchHeader::default()
        };

        let mut requests = Slab::new();
        let mut posted = VecDeque::new();
        for _ in 0..128 {
            let mut want = shape(&mut rng);
            if rng.gen_bool(0.1) {
                want.tag = ANY_TAG;
            }
            if rng.gen_bool(0.1) {
                want.rank = ANY_SRC;
            }
            let ignore = [0, 0x1, 0x3, 0xc][rng.gen_range(0..4)];
            let iov = vec![IoVec::new(SimAddr::new(0x4000), 8)];
            let req = Request::new(RequestKind::Irecv, want, iov, want.rank, ignore);
            posted.push_back(RequestId(requests.insert(req)));
        }

        for _ in 0..128 {
            let msg = shape(&mut rng);
            // Envelope equality, tag equal outside the ignored bits or
            // wildcard, source equal or wildcard.
            let accepts = |req: &Request| {
                let want = &req.hdr;
                (want.tag == ANY_TAG || (want.tag ^ msg.tag) & !req.ignore == 0)
                    && (want.rank == ANY_SRC || want.rank == msg.rank)
                    && want.group == msg.group
                    && want.count == msg.count
                    && want.dtype_size == msg.dtype_size
            };
            let pos = posted.iter().position(|id: &RequestId| accepts(&requests[id.0]));
            let expected = pos.map(|p| posted[p]);
            let examined = pos.map_or(posted.len(), |p| p + 1);

            let walk = search_posted(&mut posted, &requests, &msg).unwrap();
            assert_eq!(walk.found, expected);
            assert_eq!(walk.examined, examined);
            if let Some(id) = expected {
                assert!(!posted.contains(&id));
            }
        }
    }
}
