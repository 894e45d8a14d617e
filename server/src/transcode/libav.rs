//! In-process H.264 re-encode through the libav* libraries.
//!
//! Decodes the best video stream frame by frame and re-encodes it at the
//! source resolution and frame rate.  Audio is dropped.  Built only with the
//! `libav` feature; otherwise the backend reports itself unavailable.

use super::{TranscodeBackend, TranscodeError, TranscodeJob};

pub struct InProcessEncoder;

impl TranscodeBackend for InProcessEncoder {
    fn name(&self) -> &str {
        "libav"
    }

    #[cfg(feature = "libav")]
    fn attempt_transcode(&self, job: &TranscodeJob) -> Result<(), TranscodeError> {
        imp::reencode(job)
    }

    #[cfg(not(feature = "libav"))]
    fn attempt_transcode(&self, _job: &TranscodeJob) -> Result<(), TranscodeError> {
        Err(TranscodeError::Unavailable(
            "built without the libav feature".into(),
        ))
    }
}

#[cfg(feature = "libav")]
mod imp {
    use ffmpeg_next as ffmpeg;

    use ffmpeg::format::Pixel;
    use ffmpeg::software::scaling;
    use ffmpeg::{codec, decoder, encoder, format, frame, media, Dictionary, Packet, Rational};
    use tracing::{debug, info};

    use super::{TranscodeError, TranscodeJob};

    fn av(e: ffmpeg::Error) -> TranscodeError {
        TranscodeError::Failed(e.to_string())
    }

    struct Pipeline {
        decoder: decoder::Video,
        scaler: scaling::Context,
        encoder: encoder::Video,
        ost_index: usize,
        enc_time_base: Rational,
        ost_time_base: Rational,
        frames: u64,
    }

    impl Pipeline {
        /// Pull every decoded frame and push it to the encoder, numbering
        /// frames sequentially so the output is constant frame rate.
        fn drain_decoder(
            &mut self,
            octx: &mut format::context::Output,
            max_frames: u64,
        ) -> Result<(), TranscodeError> {
            let mut decoded = frame::Video::empty();
            let mut scaled = frame::Video::empty();
            while self.frames < max_frames && self.decoder.receive_frame(&mut decoded).is_ok() {
                self.scaler.run(&decoded, &mut scaled).map_err(av)?;
                scaled.set_pts(Some(self.frames as i64));
                self.encoder.send_frame(&scaled).map_err(av)?;
                self.frames += 1;
                self.drain_encoder(octx)?;
            }
            Ok(())
        }

        fn drain_encoder(&mut self, octx: &mut format::context::Output) -> Result<(), TranscodeError> {
            let mut encoded = Packet::empty();
            while self.encoder.receive_packet(&mut encoded).is_ok() {
                encoded.set_stream(self.ost_index);
                encoded.rescale_ts(self.enc_time_base, self.ost_time_base);
                encoded.write_interleaved(octx).map_err(av)?;
            }
            Ok(())
        }
    }

    pub(super) fn reencode(job: &TranscodeJob) -> Result<(), TranscodeError> {
        ffmpeg::init().map_err(av)?;

        let mut ictx = format::input(&job.input).map_err(av)?;
        let (ist_index, fps, decoder) = {
            let ist = ictx
                .streams()
                .best(media::Type::Video)
                .ok_or_else(|| TranscodeError::Failed("no video stream".into()))?;
            let rate = ist.avg_frame_rate();
            let fps = if rate.numerator() > 0 && rate.denominator() > 0 {
                rate
            } else {
                Rational::new(job.default_fps as i32, 1)
            };
            let decoder = codec::context::Context::from_parameters(ist.parameters())
                .map_err(av)?
                .decoder()
                .video()
                .map_err(av)?;
            (ist.index(), fps, decoder)
        };
        let (width, height) = (decoder.width(), decoder.height());
        // 4:2:0 chroma needs even dimensions.
        let (out_w, out_h) = (width & !1, height & !1);
        if out_w == 0 || out_h == 0 {
            return Err(TranscodeError::Failed("unknown frame size".into()));
        }

        let mut octx = format::output_as(&job.output, "mp4").map_err(av)?;
        let global_header = octx.format().flags().contains(format::Flags::GLOBAL_HEADER);

        let h264 = encoder::find_by_name("libx264")
            .or_else(|| encoder::find(codec::Id::H264))
            .ok_or_else(|| TranscodeError::Unavailable("no H.264 encoder in libavcodec".into()))?;

        let enc_time_base = fps.invert();
        let (ost_index, encoder) = {
            let mut ost = octx.add_stream(h264).map_err(av)?;
            let mut enc = codec::context::Context::new_with_codec(h264)
                .encoder()
                .video()
                .map_err(av)?;
            enc.set_width(out_w);
            enc.set_height(out_h);
            enc.set_format(Pixel::YUV420P);
            enc.set_time_base(enc_time_base);
            enc.set_frame_rate(Some(fps));
            if global_header {
                enc.set_flags(codec::Flags::GLOBAL_HEADER);
            }

            let mut opts = Dictionary::new();
            opts.set("preset", "veryfast");
            let opened = enc.open_with(opts).map_err(av)?;
            ost.set_parameters(&opened);
            (ost.index(), opened)
        };

        let mut muxer_opts = Dictionary::new();
        muxer_opts.set("movflags", "+faststart");
        octx.write_header_with(muxer_opts).map_err(av)?;
        let ost_time_base = octx
            .stream(ost_index)
            .map(|s| s.time_base())
            .unwrap_or(enc_time_base);

        let scaler = scaling::Context::get(
            decoder.format(),
            width,
            height,
            Pixel::YUV420P,
            out_w,
            out_h,
            scaling::Flags::BILINEAR,
        )
        .map_err(av)?;

        let mut pipeline = Pipeline {
            decoder,
            scaler,
            encoder,
            ost_index,
            enc_time_base,
            ost_time_base,
            frames: 0,
        };

        info!(
            "Re-encoding {} in process ({out_w}x{out_h} @ {:.2} fps)",
            job.input.display(),
            f64::from(fps)
        );

        for (stream, packet) in ictx.packets() {
            if stream.index() != ist_index {
                continue;
            }
            pipeline.decoder.send_packet(&packet).map_err(av)?;
            pipeline.drain_decoder(&mut octx, job.max_frames)?;
            if pipeline.frames >= job.max_frames {
                debug!("Frame cap {} reached", job.max_frames);
                break;
            }
        }

        if pipeline.frames < job.max_frames {
            pipeline.decoder.send_eof().map_err(av)?;
            pipeline.drain_decoder(&mut octx, job.max_frames)?;
        }
        pipeline.encoder.send_eof().map_err(av)?;
        pipeline.drain_encoder(&mut octx)?;
        octx.write_trailer().map_err(av)?;

        if pipeline.frames == 0 {
            return Err(TranscodeError::Failed("no frames decoded".into()));
        }
        Ok(())
    }
}
