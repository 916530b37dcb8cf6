// Copyright 2024, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! LC3 codec library boundary.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Lc3Error {
    #[error("unsupported codec parameters")]
    InvalidParameters,
    #[error("encoding failed ({0})")]
    Encode(i32),
    #[error("decoding failed ({0})")]
    Decode(i32),
}

/// One LC3 encoder instance, bound to a frame duration, a stream sampling
/// rate and the PCM input rate it resamples from.
pub trait Lc3Encoder {
    /// Encode one frame. `stride` is the distance between consecutive
    /// samples of this channel in `pcm` (2 for interleaved stereo input).
    fn encode(&mut self, pcm: &[i16], stride: usize, out: &mut [u8]) -> Result<(), Lc3Error>;
}

/// One LC3 decoder instance. Decoding `None` performs packet loss
/// concealment into `out_pcm`.
pub trait Lc3Decoder {
    fn decode(&mut self, data: Option<&[u8]>, out_pcm: &mut [i16]) -> Result<(), Lc3Error>;
}

/// LC3 library entry points.
pub trait Lc3 {
    /// Number of PCM samples per channel in one frame, or `None` for an
    /// unsupported duration/rate pair.
    fn frame_samples(&self, frame_duration_us: u32, sample_rate_hz: u32) -> Option<usize>;

    fn new_encoder(
        &self,
        frame_duration_us: u32,
        stream_rate_hz: u32,
        pcm_rate_hz: u32,
    ) -> Option<Box<dyn Lc3Encoder>>;

    fn new_decoder(
        &self,
        frame_duration_us: u32,
        stream_rate_hz: u32,
        pcm_rate_hz: u32,
    ) -> Option<Box<dyn Lc3Decoder>>;
}
