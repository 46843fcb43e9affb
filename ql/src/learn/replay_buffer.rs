use std::collections::VecDeque;

use rand::seq::index;
use rand::Rng;

/// One observed step: `state` --`action`--> `next_state`, earning `reward`.
#[derive(Clone, Debug, PartialEq)]
pub struct Transition<S, A> {
    pub state: S,
    pub action: A,
    pub reward: f64,
    pub next_state: S,
    pub done: bool,
}

/// Experience replay buffer.
///
/// Fixed capacity; once full, adding a transition evicts the oldest one.
pub struct ReplayBuffer<S, A> {
    max_buffer_len: usize,
    buffer: VecDeque<Transition<S, A>>,
}

impl<S, A> ReplayBuffer<S, A> {
    pub fn new(max_buffer_len: usize) -> Self {
        assert!(max_buffer_len > 0);
        Self {
            max_buffer_len,
            buffer: VecDeque::with_capacity(max_buffer_len),
        }
    }

    pub fn len(&self) -> usize { self.buffer.len() }

    pub fn is_empty(&self) -> bool { self.buffer.is_empty() }

    pub fn capacity(&self) -> usize { self.max_buffer_len }

    pub fn add(
        &mut self,
        transition: Transition<S, A>,
    ) {
        if self.buffer.len() == self.max_buffer_len {
            self.buffer.pop_front();
        }
        self.buffer.push_back(transition);
    }

    /// Uniform random sample of `batch_size` distinct transitions.
    /// Returns `None` as long as the buffer holds less than `batch_size` elements.
    pub fn sample<R: Rng>(
        &self,
        rng: &mut R,
        batch_size: usize,
    ) -> Option<Vec<&Transition<S, A>>> {
        if batch_size == 0 || self.buffer.len() < batch_size {
            return None;
        }
        let indices = index::sample(rng, self.buffer.len(), batch_size);
        Some(indices.iter().map(|i| &self.buffer[i]).collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transition<S, A>> {
        self.buffer.iter()
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn transition(i: usize) -> Transition<usize, u8> {
        Transition {
            state: i,
            action: 0,
            reward: i as f64,
            next_state: i + 1,
            done: false,
        }
    }

    #[test]
    fn test_evicts_oldest_when_full() {
        let mut buffer = ReplayBuffer::new(3);
        for i in 0..5 {
            buffer.add(transition(i));
        }
        assert_eq!(buffer.len(), 3);
        let states: Vec<usize> = buffer.iter().map(|t| t.state).collect();
        assert_eq!(states, vec![2, 3, 4]);
    }

    #[test]
    fn test_sample_needs_a_full_batch() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut buffer = ReplayBuffer::new(100);
        for i in 0..31 {
            buffer.add(transition(i));
        }
        assert!(buffer.sample(&mut rng, 32).is_none());
        buffer.add(transition(31));
        assert_eq!(buffer.sample(&mut rng, 32).unwrap().len(), 32);
    }

    #[test]
    fn test_100x_sample_is_distinct() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut buffer = ReplayBuffer::new(100);
        for i in 0..100 {
            buffer.add(transition(i));
        }
        for _ in 0..100 {
            let mut states: Vec<usize> = buffer.sample(&mut rng, 50).unwrap().iter().map(|t| t.state).collect();
            states.sort();
            states.dedup();
            assert_eq!(states.len(), 50);
            assert!(states.iter().all(|e| (0..100).contains(e)));
        }
    }
}
