// 帧格式转换（CPU 路径，BT.601 有限范围）

use super::types::{AudioFrame, PixelFormat, SampleBuffer, SampleFormat, VideoFrame};
use bytes::Bytes;

/// 视频帧格式转换，不支持的组合返回 None
pub fn convert_video(frame: &VideoFrame, target: PixelFormat) -> Option<VideoFrame> {
    if frame.format == target {
        return Some(frame.clone());
    }
    let (w, h) = (frame.width as usize, frame.height as usize);
    if frame.data.len() < frame.format.frame_size(frame.width, frame.height) {
        return None;
    }

    let data: Vec<u8> = match (frame.format, target) {
        (PixelFormat::RGBA, PixelFormat::RGB) => frame
            .data
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect(),
        (PixelFormat::RGB, PixelFormat::RGBA) => frame
            .data
            .chunks_exact(3)
            .flat_map(|px| [px[0], px[1], px[2], 255])
            .collect(),
        (PixelFormat::YUV420P, PixelFormat::RGBA | PixelFormat::RGB) => {
            let cw = w.div_ceil(2);
            let ch = h.div_ceil(2);
            let y_plane = &frame.data[..w * h];
            let u_plane = &frame.data[w * h..w * h + cw * ch];
            let v_plane = &frame.data[w * h + cw * ch..w * h + 2 * cw * ch];
            yuv_to_rgb(w, h, target == PixelFormat::RGBA, |x, y| {
                let c = (y / 2) * cw + x / 2;
                (y_plane[y * w + x], u_plane[c], v_plane[c])
            })
        }
        (PixelFormat::NV12, PixelFormat::RGBA | PixelFormat::RGB) => {
            let cw = w.div_ceil(2);
            let y_plane = &frame.data[..w * h];
            let uv_plane = &frame.data[w * h..];
            yuv_to_rgb(w, h, target == PixelFormat::RGBA, |x, y| {
                let c = ((y / 2) * cw + x / 2) * 2;
                (y_plane[y * w + x], uv_plane[c], uv_plane[c + 1])
            })
        }
        _ => return None,
    };

    Some(VideoFrame {
        format: target,
        data: Bytes::from(data),
        ..frame.clone()
    })
}

fn yuv_to_rgb<F>(w: usize, h: usize, alpha: bool, sample: F) -> Vec<u8>
where
    F: Fn(usize, usize) -> (u8, u8, u8),
{
    let bpp = if alpha { 4 } else { 3 };
    let mut out = Vec::with_capacity(w * h * bpp);
    for y in 0..h {
        for x in 0..w {
            let (yy, u, v) = sample(x, y);
            let c = yy as f32 - 16.0;
            let d = u as f32 - 128.0;
            let e = v as f32 - 128.0;
            let r = 1.164 * c + 1.596 * e;
            let g = 1.164 * c - 0.392 * d - 0.813 * e;
            let b = 1.164 * c + 2.017 * d;
            out.push(r.clamp(0.0, 255.0) as u8);
            out.push(g.clamp(0.0, 255.0) as u8);
            out.push(b.clamp(0.0, 255.0) as u8);
            if alpha {
                out.push(255);
            }
        }
    }
    out
}

/// 音频采样格式转换
pub fn convert_audio(frame: &AudioFrame, target: SampleFormat) -> AudioFrame {
    let data = match (&frame.data, target) {
        (SampleBuffer::F32(s), SampleFormat::I16) => SampleBuffer::I16(
            s.iter()
                .map(|v| (v.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                .collect(),
        ),
        (SampleBuffer::I16(s), SampleFormat::F32) => {
            SampleBuffer::F32(s.iter().map(|v| *v as f32 / i16::MAX as f32).collect())
        }
        (data, _) => data.clone(),
    };
    AudioFrame {
        data,
        ..frame.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(format: PixelFormat, data: Vec<u8>) -> VideoFrame {
        VideoFrame {
            timestamp: 0.0,
            duration: 0.04,
            width: 2,
            height: 2,
            format,
            data: Bytes::from(data),
        }
    }

    #[test]
    fn rgba_to_rgb_drops_alpha() {
        let f = frame(PixelFormat::RGBA, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]);
        let out = convert_video(&f, PixelFormat::RGB).unwrap();
        assert_eq!(&out.data[..], &[1, 2, 3, 5, 6, 7, 9, 10, 11, 13, 14, 15]);
    }

    #[test]
    fn yuv_gray_maps_to_gray() {
        // Y=128, U=V=128 -> 中灰
        let f = frame(PixelFormat::YUV420P, vec![128, 128, 128, 128, 128, 128]);
        let out = convert_video(&f, PixelFormat::RGBA).unwrap();
        assert_eq!(out.data.len(), 16);
        assert!(out.data.chunks_exact(4).all(|px| px[0] == px[1] && px[1] == px[2] && px[3] == 255));
    }

    #[test]
    fn unsupported_conversion_is_none() {
        let f = frame(PixelFormat::RGB, vec![0; 12]);
        assert!(convert_video(&f, PixelFormat::NV12).is_none());
    }

    #[test]
    fn audio_roundtrip_keeps_length() {
        let f = AudioFrame::silence(0.0, 0.01, 1000, 1);
        let i = convert_audio(&f, SampleFormat::I16);
        assert_eq!(i.data.format(), SampleFormat::I16);
        assert_eq!(i.data.len(), 10);
    }
}
