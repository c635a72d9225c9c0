//! Software H.264 encoder using OpenH264
//!
//! Emits an Annex B elementary stream. The stream header holds SPS and PPS,
//! taken from a primer encode when the encoder is created; the first real
//! frame is then forced to IDR so the stream starts decodable.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use openh264::encoder::{
    BitRate, Encoder, EncoderConfig as OpenH264Config, FrameRate, IntraFramePeriod, Level,
    Profile, QpRange, RateControlMode,
};
use openh264::formats::YUVSlices;
use openh264::{nal_units, OpenH264API};
use tracing::{debug, info, warn};

use super::traits::{
    EncoderConfig, H264Profile, InputBuffer, InputBufferPool, OutputUnit, VideoEncoder,
};
use crate::error::{PipelineError, Result};
use crate::video::format::{PixelFormat, Resolution};

const NAL_IDR: u8 = 5;
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;

/// NAL unit type of an Annex B unit (start code included)
fn nal_type(nal: &[u8]) -> Option<u8> {
    let start = if nal.starts_with(&[0, 0, 0, 1]) {
        4
    } else if nal.starts_with(&[0, 0, 1]) {
        3
    } else {
        0
    };
    nal.get(start).map(|b| b & 0x1f)
}

fn is_parameter_set(nal: &[u8]) -> bool {
    matches!(nal_type(nal), Some(NAL_SPS) | Some(NAL_PPS))
}

/// Split an access unit into parameter sets and picture data
fn split_access_unit(bitstream: &[u8]) -> (BytesMut, BytesMut) {
    let mut params = BytesMut::new();
    let mut picture = BytesMut::with_capacity(bitstream.len());
    for nal in nal_units(bitstream) {
        if is_parameter_set(nal) {
            params.extend_from_slice(nal);
        } else {
            picture.extend_from_slice(nal);
        }
    }
    (params, picture)
}

fn level_from(level: u8) -> Result<Level> {
    Ok(match level {
        10 => Level::Level_1_0,
        11 => Level::Level_1_1,
        12 => Level::Level_1_2,
        13 => Level::Level_1_3,
        20 => Level::Level_2_0,
        21 => Level::Level_2_1,
        22 => Level::Level_2_2,
        30 => Level::Level_3_0,
        31 => Level::Level_3_1,
        32 => Level::Level_3_2,
        40 => Level::Level_4_0,
        41 => Level::Level_4_1,
        42 => Level::Level_4_2,
        50 => Level::Level_5_0,
        51 => Level::Level_5_1,
        52 => Level::Level_5_2,
        other => {
            return Err(PipelineError::Encoder(format!(
                "Unsupported H.264 level {}.{}",
                other / 10,
                other % 10
            )))
        }
    })
}

fn profile_from(profile: H264Profile) -> Profile {
    match profile {
        H264Profile::Baseline => Profile::Baseline,
        H264Profile::Main => Profile::Main,
        H264Profile::High => Profile::High,
    }
}

pub struct H264Encoder {
    config: EncoderConfig,
    encoder: Encoder,
    pool: Arc<InputBufferPool>,
    header: Bytes,
    pending: Option<OutputUnit>,
    frames: u64,
}

impl H264Encoder {
    pub fn new(config: EncoderConfig) -> Result<Self> {
        if config.input_format != PixelFormat::Yuv420 {
            return Err(PipelineError::Encoder(format!(
                "H.264 encoder needs YUV420 input, got {}",
                config.input_format
            )));
        }
        if config.output != config.input {
            return Err(PipelineError::Encoder(format!(
                "H.264 encoder cannot scale {} to {}",
                config.input, config.output
            )));
        }
        if config.input_stride != config.input.width {
            return Err(PipelineError::Encoder(format!(
                "Unsupported input stride {}",
                config.input_stride
            )));
        }
        let params = &config.params;
        params.validate()?;

        let mut encoder_config = OpenH264Config::new()
            .bitrate(BitRate::from_bps(params.bitrate))
            .max_frame_rate(FrameRate::from_hz(params.framerate as f32))
            .intra_frame_period(IntraFramePeriod::from_num_frames(params.max_key_interval))
            .profile(profile_from(params.profile))
            .level(level_from(params.level)?);
        encoder_config = match params.fixed_qp {
            // OpenH264 has one QP window for all slice types
            Some(qp) => encoder_config
                .rate_control_mode(RateControlMode::Off)
                .qp(QpRange::new(qp.i.min(qp.p), qp.i.max(qp.p))),
            None => encoder_config
                .rate_control_mode(RateControlMode::Bitrate)
                .qp(QpRange::new(params.qp_min, params.qp_max)),
        };
        if params.cabac && params.profile == H264Profile::Baseline {
            warn!("CABAC is not available in the baseline profile, using CAVLC");
        }

        let api = OpenH264API::from_source();
        let mut encoder = Encoder::with_api_config(api, encoder_config)
            .map_err(|e| PipelineError::Encoder(format!("Failed to create H.264 encoder: {}", e)))?;

        let header = primer_header(&mut encoder, config.input)?;
        encoder.force_intra_frame();

        let pool = InputBufferPool::new(params.input_buffers, config.input);
        info!(
            "H.264 encoder ready: {}@{}fps, {} bps, profile {}, level {}.{}",
            config.output,
            params.framerate,
            params.bitrate,
            params.profile,
            params.level / 10,
            params.level % 10
        );
        debug!("H.264 stream header: {} bytes", header.len());

        Ok(Self {
            config,
            encoder,
            pool,
            header,
            pending: None,
            frames: 0,
        })
    }

    /// Frames encoded so far
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

/// Encode one black frame and keep its SPS and PPS
fn primer_header(encoder: &mut Encoder, resolution: Resolution) -> Result<Bytes> {
    let w = resolution.width as usize;
    let h = resolution.height as usize;
    let y = vec![16u8; w * h];
    let uv = vec![128u8; (w / 2) * (h / 2)];
    let yuv = YUVSlices::new((&y[..], &uv[..], &uv[..]), (w, h), (w, w / 2, w / 2));

    let bitstream = encoder
        .encode(&yuv)
        .map_err(|e| PipelineError::Encoder(format!("Failed to encode primer frame: {}", e)))?
        .to_vec();
    let (params, _) = split_access_unit(&bitstream);
    if params.is_empty() {
        return Err(PipelineError::Encoder(
            "H.264 encoder produced no SPS/PPS".to_string(),
        ));
    }
    Ok(params.freeze())
}

impl VideoEncoder for H264Encoder {
    fn name(&self) -> &str {
        "openh264"
    }

    fn config(&self) -> &EncoderConfig {
        &self.config
    }

    fn header(&self) -> Bytes {
        self.header.clone()
    }

    fn input_pool(&self) -> Arc<InputBufferPool> {
        self.pool.clone()
    }

    fn encode_one_frame(&mut self, input: &InputBuffer) -> Result<()> {
        let resolution = self.config.input;
        let luma = resolution.pixels() as usize;
        if input.y.len() != luma || input.c.len() != luma / 2 {
            return Err(PipelineError::Encoder(format!(
                "Input buffer {} has wrong plane sizes {}+{}",
                input.id(),
                input.y.len(),
                input.c.len()
            )));
        }
        if self.pending.is_some() {
            return Err(PipelineError::Encoder(
                "Previous output was not retrieved".to_string(),
            ));
        }

        let w = resolution.width as usize;
        let h = resolution.height as usize;
        let yuv = YUVSlices::new(
            (&input.y[..], input.u_plane(), input.v_plane()),
            (w, h),
            (w, w / 2, w / 2),
        );
        let bitstream = self
            .encoder
            .encode(&yuv)
            .map_err(|e| PipelineError::Encoder(format!("H.264 encode failed: {}", e)))?
            .to_vec();
        self.frames += 1;

        // Parameter sets repeated before an IDR go in their own segment
        let (params, picture) = split_access_unit(&bitstream);
        if picture.is_empty() {
            debug!("Encoder skipped frame {}", self.frames);
            return Ok(());
        }
        if nal_units(&picture).any(|nal| nal_type(nal) == Some(NAL_IDR)) {
            debug!("Key frame at frame {}", self.frames);
        }
        let mut segments = Vec::with_capacity(2);
        if !params.is_empty() {
            segments.push(params.freeze());
        }
        segments.push(picture.freeze());
        self.pending = Some(OutputUnit { segments });
        Ok(())
    }

    fn acquire_output_buffer(&mut self) -> Result<Option<OutputUnit>> {
        Ok(self.pending.take())
    }

    fn release_output_buffer(&mut self, output: OutputUnit) {
        debug!("Released output unit of {} bytes", output.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::traits::{CodecParams, FixedQp};
    use openh264::decoder::Decoder;

    const RES: Resolution = Resolution {
        width: 64,
        height: 48,
    };

    fn encoder(params: CodecParams) -> H264Encoder {
        H264Encoder::new(EncoderConfig::for_capture(RES, params)).unwrap()
    }

    fn nal_types(data: &[u8]) -> Vec<u8> {
        nal_units(data).filter_map(nal_type).collect()
    }

    fn gradient(enc: &H264Encoder, shift: u8) -> InputBuffer {
        let mut input = enc.input_pool().acquire().unwrap();
        for (i, px) in input.y.iter_mut().enumerate() {
            *px = (i as u8).wrapping_add(shift);
        }
        input.c.fill(128);
        input
    }

    #[test]
    fn test_nal_type() {
        assert_eq!(nal_type(&[0, 0, 0, 1, 0x67, 0x42]), Some(NAL_SPS));
        assert_eq!(nal_type(&[0, 0, 1, 0x68]), Some(NAL_PPS));
        assert_eq!(nal_type(&[0, 0, 0, 1, 0x65]), Some(NAL_IDR));
        assert_eq!(nal_type(&[]), None);
    }

    #[test]
    fn test_header_holds_parameter_sets() {
        let enc = encoder(CodecParams::default());
        let types = nal_types(&enc.header());
        assert!(types.contains(&NAL_SPS));
        assert!(types.contains(&NAL_PPS));
        assert!(types.iter().all(|t| *t == NAL_SPS || *t == NAL_PPS));
    }

    #[test]
    fn test_first_frame_is_idr() {
        let mut enc = encoder(CodecParams::default());
        let input = gradient(&enc, 0);
        enc.encode_one_frame(&input).unwrap();
        enc.pool.release(input);

        let out = enc.acquire_output_buffer().unwrap().unwrap();
        assert!(out.segments.len() <= 2);
        let picture = out.segments.last().unwrap();
        assert!(nal_types(picture).contains(&NAL_IDR));
        enc.release_output_buffer(out);
        assert!(enc.acquire_output_buffer().unwrap().is_none());
        assert_eq!(enc.frames(), 1);
    }

    #[test]
    fn test_stream_decodes() {
        let mut enc = encoder(CodecParams {
            fixed_qp: None,
            bitrate: 500_000,
            ..Default::default()
        });
        let mut stream = enc.header().to_vec();
        for shift in 0..5u8 {
            let input = gradient(&enc, shift * 3);
            enc.encode_one_frame(&input).unwrap();
            enc.pool.release(input);
            if let Some(out) = enc.acquire_output_buffer().unwrap() {
                for segment in &out.segments {
                    stream.extend_from_slice(segment);
                }
            }
        }

        let mut decoder = Decoder::new().unwrap();
        let mut pictures = 0;
        for nal in nal_units(&stream) {
            if decoder.decode(nal).unwrap().is_some() {
                pictures += 1;
            }
        }
        assert!(pictures > 0);
    }

    #[test]
    fn test_fixed_qp_encoder() {
        let mut enc = encoder(CodecParams {
            fixed_qp: Some(FixedQp { i: 22, p: 28 }),
            ..Default::default()
        });
        let input = gradient(&enc, 0);
        enc.encode_one_frame(&input).unwrap();
        enc.pool.release(input);
        assert!(enc.acquire_output_buffer().unwrap().is_some());
    }

    #[test]
    fn test_rejects_unknown_level() {
        let err = H264Encoder::new(EncoderConfig::for_capture(
            RES,
            CodecParams {
                level: 33,
                ..Default::default()
            },
        ))
        .err()
        .unwrap();
        assert!(matches!(err, PipelineError::Encoder(_)));
    }

    #[test]
    fn test_wrong_plane_sizes() {
        let mut enc = encoder(CodecParams::default());
        let input = InputBuffer::new(9, Resolution::new(4, 2));
        assert!(enc.encode_one_frame(&input).is_err());
    }
}
