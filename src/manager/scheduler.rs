use crate::piece::{BlockInfo, DownloadState, PieceSet};
use crate::tracker::PeerId;
use rand::seq::SliceRandom;
use rand::Rng;

/// A peer the scheduler may ask: active, unchoked us, with these pieces
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub peer_id: &'a PeerId,
    pub pieces: &'a PieceSet,
}

/// One scheduling pass. For each incomplete piece, pick uniformly at random
/// among candidates holding it and claim every block not already in flight.
/// Returns the claims made, in piece then offset order.
pub fn plan_requests<R: Rng + ?Sized>(
    download: &mut DownloadState,
    candidates: &[Candidate<'_>],
    rng: &mut R,
) -> Vec<(PeerId, BlockInfo)> {
    let mut planned = Vec::new();

    for piece_index in download.store().incomplete_pieces() {
        let holders: Vec<&Candidate<'_>> = candidates
            .iter()
            .filter(|candidate| candidate.pieces.contains(&piece_index))
            .collect();

        let chosen = match holders.choose(rng) {
            Some(candidate) => candidate.peer_id,
            None => continue,
        };

        let blocks = match download.store().missing_blocks(piece_index) {
            Ok(blocks) => blocks,
            Err(_) => continue,
        };

        for block in blocks {
            if download.requests().contains(&block.key()) {
                continue;
            }
            if download.claim(block, chosen) {
                planned.push((chosen.clone(), block));
            }
        }
    }

    planned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::{Delivery, FileId, PieceStore};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn state() -> DownloadState {
        DownloadState::new(
            PieceStore::with_block_size(FileId::from("f"), 2500, 1024, 256).unwrap(),
        )
    }

    fn serve(download: &mut DownloadState, source: &[u8], block: &BlockInfo) -> Delivery {
        let start = block.piece_index as usize * 1024 + block.offset as usize;
        let data = &source[start..start + block.length as usize];
        download.deliver(block.piece_index, block.offset, data).unwrap()
    }

    #[test]
    fn test_only_holders_are_asked() {
        let mut download = state();
        let a = PeerId::from("a");
        let pieces: PieceSet = [1].into_iter().collect();
        let candidates = [Candidate {
            peer_id: &a,
            pieces: &pieces,
        }];

        let plan = plan_requests(&mut download, &candidates, &mut StdRng::seed_from_u64(1));

        assert_eq!(plan.len(), 4);
        assert!(plan.iter().all(|(peer, block)| peer == &a && block.piece_index == 1));
        assert_eq!(download.requests().len(), 4);
    }

    #[test]
    fn test_second_pass_claims_nothing_in_flight() {
        let mut download = state();
        let a = PeerId::from("a");
        let all: PieceSet = (0..3).collect();
        let candidates = [Candidate {
            peer_id: &a,
            pieces: &all,
        }];
        let mut rng = StdRng::seed_from_u64(2);

        let first = plan_requests(&mut download, &candidates, &mut rng);
        let second = plan_requests(&mut download, &candidates, &mut rng);

        assert_eq!(first.len(), 10);
        assert!(second.is_empty());
    }

    #[test]
    fn test_two_peers_with_disjoint_pieces_complete_the_file() {
        let source = content(2500);
        let mut download = state();
        let a = PeerId::from("a");
        let b = PeerId::from("b");
        let held_a: PieceSet = [0, 2].into_iter().collect();
        let held_b: PieceSet = [1].into_iter().collect();
        let candidates = [
            Candidate {
                peer_id: &a,
                pieces: &held_a,
            },
            Candidate {
                peer_id: &b,
                pieces: &held_b,
            },
        ];

        let plan = plan_requests(&mut download, &candidates, &mut StdRng::seed_from_u64(3));
        for (peer, block) in &plan {
            let expected = if block.piece_index == 1 { &b } else { &a };
            assert_eq!(peer, expected);
        }

        // Deliver b's blocks first, then a's in reverse.
        let (from_b, from_a): (Vec<_>, Vec<_>) = plan.iter().partition(|(peer, _)| peer == &b);
        for (_, block) in from_b.iter().chain(from_a.iter().rev()) {
            serve(&mut download, &source, block);
        }

        assert!(download.store().is_file_complete());
        assert!(download.requests().is_empty());
        assert_eq!(download.store().assemble().unwrap(), source);
    }

    #[test]
    fn test_dropped_peer_blocks_go_to_another() {
        let source = content(2500);
        let mut download = state();
        let a = PeerId::from("a");
        let b = PeerId::from("b");
        let all: PieceSet = (0..3).collect();

        let only_a = [Candidate {
            peer_id: &a,
            pieces: &all,
        }];
        let plan = plan_requests(&mut download, &only_a, &mut StdRng::seed_from_u64(4));
        assert!(plan.iter().any(|(_, block)| block.piece_index == 0 && block.offset == 0));

        // a answers everything except (0, 0), then drops
        for (_, block) in plan.iter().filter(|(_, block)| block.key() != (0, 0)) {
            serve(&mut download, &source, block);
        }
        assert_eq!(download.release_peer(&a), 1);

        let only_b = [Candidate {
            peer_id: &b,
            pieces: &all,
        }];
        let retry = plan_requests(&mut download, &only_b, &mut StdRng::seed_from_u64(5));
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].0, b);
        assert_eq!(retry[0].1.key(), (0, 0));

        let delivery = serve(&mut download, &source, &retry[0].1);
        assert_eq!(
            delivery,
            Delivery::Stored {
                piece_complete: true,
                file_complete: true
            }
        );
        assert_eq!(download.store().assemble().unwrap(), source);
    }

    #[test]
    fn test_no_candidates_no_claims() {
        let mut download = state();
        let plan = plan_requests(&mut download, &[], &mut StdRng::seed_from_u64(6));
        assert!(plan.is_empty());
        assert!(download.requests().is_empty());
    }
}
