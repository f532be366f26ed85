//! Audio decoding with symphonia and resampling with rubato.

use crate::audio::{AudioData, AudioError, AudioInfo};
use rubato::{FftFixedInOut, Resampler};
use std::io::Cursor;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Frames per resampler chunk.
const RESAMPLE_CHUNK: usize = 1024;

fn open(bytes: Vec<u8>, extension: Option<&str>) -> Result<Box<dyn FormatReader>, AudioError> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| match e {
            SymphoniaError::Unsupported(what) => AudioError::UnsupportedFormat(what.to_string()),
            other => AudioError::Decode(format!("Failed to probe format: {other}")),
        })?;
    Ok(probed.format)
}

/// Lower-cased extension of a file name, if any.
pub fn extension_of(filename: &str) -> Option<String> {
    std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

/// Read container metadata, decoding the stream only when the container does
/// not state its length.
pub fn probe(bytes: Vec<u8>, filename: &str) -> Result<AudioInfo, AudioError> {
    let extension = extension_of(filename);
    let format = open(bytes.clone(), extension.as_deref())?;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(AudioError::NoAudioTrack)?;
    let params = &track.codec_params;

    let sample_rate = params
        .sample_rate
        .ok_or_else(|| AudioError::Decode("Sample rate unknown".to_string()))?;
    let channels = params.channels.map(|c| c.count() as u16).unwrap_or(1);

    let duration = match params.n_frames {
        Some(frames) => frames as f64 / f64::from(sample_rate),
        None => {
            let (samples, rate) = decode_mono(bytes, extension.as_deref())?;
            samples.len() as f64 / f64::from(rate)
        }
    };

    Ok(AudioInfo {
        format: extension.unwrap_or_else(|| "unknown".to_string()),
        duration,
        sample_rate,
        channels,
    })
}

/// Decode an uploaded file into mono samples at `target_rate`.
pub fn decode(bytes: Vec<u8>, filename: &str, target_rate: u32) -> Result<AudioData, AudioError> {
    let extension = extension_of(filename);
    let (samples, rate) = decode_mono(bytes, extension.as_deref())?;
    if samples.is_empty() {
        return Err(AudioError::Empty);
    }

    let samples = if rate != target_rate {
        tracing::debug!(from = rate, to = target_rate, "Resampling audio");
        resample(&samples, rate, target_rate)?
    } else {
        samples
    };

    Ok(AudioData {
        samples,
        sample_rate: target_rate,
    })
}

/// Decode the first audio track and average its channels.
fn decode_mono(bytes: Vec<u8>, extension: Option<&str>) -> Result<(Vec<f32>, u32), AudioError> {
    let mut format = open(bytes, extension)?;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(AudioError::NoAudioTrack)?;
    let track_id = track.id;
    let params = track.codec_params.clone();

    let mut sample_rate = params.sample_rate.unwrap_or(0);
    let mut decoder = symphonia::default::get_codecs()
        .make(&params, &DecoderOptions::default())
        .map_err(|e| AudioError::UnsupportedFormat(format!("No decoder: {e}")))?;

    let mut mono = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(AudioError::Decode(e.to_string())),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::warn!("Skipping corrupt packet: {}", e);
                continue;
            }
            Err(e) => return Err(AudioError::Decode(e.to_string())),
        };

        let spec = *decoded.spec();
        sample_rate = spec.rate;
        let channels = spec.channels.count().max(1);
        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);

        if channels == 1 {
            mono.extend_from_slice(buffer.samples());
        } else {
            mono.extend(
                buffer
                    .samples()
                    .chunks(channels)
                    .map(|frame| frame.iter().sum::<f32>() / channels as f32),
            );
        }
    }

    if sample_rate == 0 {
        return Err(AudioError::Decode("Sample rate unknown".to_string()));
    }
    Ok((mono, sample_rate))
}

/// Resample mono audio between rates.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, AudioError> {
    let mut resampler = FftFixedInOut::<f32>::new(from_rate as usize, to_rate as usize, RESAMPLE_CHUNK, 1)
        .map_err(|e| AudioError::Resample(e.to_string()))?;

    let ratio = f64::from(to_rate) / f64::from(from_rate);
    let expected = (samples.len() as f64 * ratio).round() as usize;
    let chunk = resampler.input_frames_next();
    let mut output = Vec::with_capacity(expected + resampler.output_frames_next());

    for piece in samples.chunks(chunk) {
        let mut input = piece.to_vec();
        input.resize(chunk, 0.0);
        let result = resampler
            .process(&[input], None)
            .map_err(|e| AudioError::Resample(e.to_string()))?;
        output.extend_from_slice(&result[0]);
    }

    // drop what the zero padding of the last chunk produced
    output.truncate(expected);
    Ok(output)
}
