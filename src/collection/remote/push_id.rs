use std::sync::{LazyLock, Mutex, PoisonError};

use rand::Rng;

use crate::collection::model::Timestamp;

const PUSH_CHARS: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";
const TIME_CHARS: usize = 8;
const RANDOM_CHARS: usize = 12;

/// Produces 20 character ids that sort in creation order.
///
/// Ids generated within the same millisecond increment the random suffix
/// instead of drawing a new one, so they stay strictly increasing.
#[derive(Debug)]
struct PushIdGenerator {
    last_millis: u64,
    suffix: [u8; RANDOM_CHARS],
}

impl PushIdGenerator {
    const fn new() -> Self {
        Self {
            last_millis: 0,
            suffix: [0; RANDOM_CHARS],
        }
    }

    fn next(&mut self, millis: u64) -> String {
        if millis == self.last_millis {
            self.increment_suffix();
        } else {
            let mut rng = rand::thread_rng();
            for slot in self.suffix.iter_mut() {
                *slot = rng.gen_range(0..64);
            }
        }
        self.last_millis = millis;

        let mut id = String::with_capacity(TIME_CHARS + RANDOM_CHARS);
        let mut remaining = millis;
        let mut time_chars = [0u8; TIME_CHARS];
        for slot in time_chars.iter_mut().rev() {
            *slot = PUSH_CHARS[(remaining % 64) as usize];
            remaining /= 64;
        }
        id.extend(time_chars.iter().map(|&ch| ch as char));
        id.extend(
            self.suffix
                .iter()
                .map(|&index| PUSH_CHARS[index as usize] as char),
        );
        id
    }

    fn increment_suffix(&mut self) {
        for slot in self.suffix.iter_mut().rev() {
            if *slot < 63 {
                *slot += 1;
                return;
            }
            *slot = 0;
        }
    }
}

static GENERATOR: LazyLock<Mutex<PushIdGenerator>> =
    LazyLock::new(|| Mutex::new(PushIdGenerator::new()));

/// Next creation-ordered id for the current wall-clock time.
pub(crate) fn next_push_id() -> String {
    let millis = Timestamp::now().to_millis().max(0) as u64;
    GENERATOR
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .next(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_have_fixed_length() {
        let id = next_push_id();
        assert_eq!(id.len(), 20);
    }

    #[test]
    fn same_millisecond_ids_increase() {
        let mut generator = PushIdGenerator::new();
        let first = generator.next(1_700_000_000_000);
        let second = generator.next(1_700_000_000_000);
        assert!(second > first);
        assert_eq!(first[..TIME_CHARS], second[..TIME_CHARS]);
    }

    #[test]
    fn later_times_sort_after() {
        let mut generator = PushIdGenerator::new();
        let first = generator.next(1_000);
        let second = generator.next(2_000);
        assert!(second > first);
    }
}
