//! Extractors: filter-based decoders turning raw module words into a
//! parameter vector.
//!
//! The address bits of a completed filter select the output slot, the data
//! bits form the integer measurement. A uniform random value from `[0, 1)`
//! is added to break up the integer binning structure in downstream
//! histograms. Within one event the first write to an address wins.

use core_arena::{Arena, ArenaError};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::datafilter::{CacheType, MultiWordFilter};
use crate::param::{is_param_valid, PipeVectors};

#[derive(Debug)]
pub struct Extractor {
    pub filter: MultiWordFilter,
    pub required_completions: u32,
    current_completions: u32,
    rng: SmallRng,
    /// Index of the module whose readout data feeds this extractor.
    pub module_index: usize,
    pub output: PipeVectors,
}

impl Extractor {
    /// Builds an extractor with an output sized `2^address_bits`. The
    /// exclusive upper limit is `2^data_bits`: the filter yields at most
    /// `2^data_bits - 1` and the added random is below one.
    pub fn new(
        arena: &mut Arena,
        filter: MultiWordFilter,
        required_completions: u32,
        rng_seed: u64,
        module_index: usize,
    ) -> Result<Extractor, ArenaError> {
        let address_count = 1usize << filter.extract_bits(CacheType::A);
        let upper_limit = (filter.extract_bits(CacheType::D) as f64).exp2();

        let output = PipeVectors::push(arena, address_count, 0.0, upper_limit)?;

        Ok(Extractor {
            filter,
            required_completions: required_completions.max(1),
            current_completions: 0,
            rng: SmallRng::seed_from_u64(rng_seed),
            module_index,
            output,
        })
    }

    /// Invalidates all output slots and clears the filter match state.
    pub fn begin_event(&mut self) {
        self.filter.clear_completion();
        self.current_completions = 0;
        self.output.data.invalidate_all();
    }

    pub fn process_module_data(&mut self, data: &[u32]) {
        for (word_index, &word) in data.iter().enumerate() {
            if self.filter.process_data(word, word_index) {
                self.current_completions += 1;

                if self.current_completions >= self.required_completions {
                    self.current_completions = 0;

                    let address = self.filter.extract(CacheType::A) as usize;
                    let value = self.filter.extract(CacheType::D);

                    debug_assert!(address < self.output.data.len());

                    if !is_param_valid(self.output.data.get(address)) {
                        let dither: f64 = self.rng.gen_range(0.0..1.0);
                        self.output.data.set(address, value as f64 + dither);
                    }
                }

                self.filter.clear_completion();
            }
        }
    }
}
