//! The interactive capture-and-match loop.
//!
//! Previews frames until the quit key or an interrupt, running a match
//! against the reference directory each time the capture key is pressed.
//! Every failure inside an iteration is reported and the loop continues.

use crate::capture::{CaptureError, TempCapture};
use crate::config::Config;
use crate::display::{DisplayError, Key, Surface, CAPTURE_WINDOW, PREVIEW_WINDOW};
use chrono::Local;
use facefind_core::{has_references, FindError, Matcher};
use facefind_hw::{read_frame_with_retry, CameraError, FrameSource};
use image::RgbImage;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const KEY_POLL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    QuitKey,
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Previewing,
    Terminated(ExitReason),
}

/// What the matcher reported for a successful search.
#[derive(Debug, Clone)]
pub struct MatchReport {
    pub label: String,
    pub identity: PathBuf,
    pub distance: f32,
    pub similarity: f32,
    pub elapsed: Duration,
}

/// Result of one match sequence. None of these stop the loop.
#[derive(Debug)]
pub enum MatchOutcome {
    Matched(MatchReport),
    NoMatch,
    SaveFailed(CaptureError),
    NoReferences,
    MatcherFailed(FindError),
}

pub struct Session<S, D, M> {
    source: S,
    surface: D,
    matcher: M,
    config: Config,
    state: SessionState,
}

impl<S: FrameSource, D: Surface, M: Matcher> Session<S, D, M> {
    pub fn new(source: S, surface: D, matcher: M, config: Config) -> Self {
        Self {
            source,
            surface,
            matcher,
            config,
            state: SessionState::Previewing,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run until the quit key or `interrupted` is set, then close every window.
    ///
    /// Display failures end the loop with an error; the camera and windows
    /// are still released when the session is dropped.
    pub fn run(&mut self, interrupted: &AtomicBool) -> anyhow::Result<ExitReason> {
        print_banner();

        let reason = loop {
            if let Some(reason) = self.step(interrupted)? {
                break reason;
            }
        };

        self.state = SessionState::Terminated(reason);
        if let Err(e) = self.surface.close_all() {
            tracing::warn!(error = %e, "failed to close windows");
        }
        tracing::info!(?reason, "capture loop finished");
        Ok(reason)
    }

    /// One loop iteration. Returns the exit reason once the loop should stop.
    pub fn step(&mut self, interrupted: &AtomicBool) -> Result<Option<ExitReason>, DisplayError> {
        if interrupted.load(Ordering::SeqCst) {
            return Ok(Some(ExitReason::Interrupted));
        }

        let frame = match read_frame_with_retry(
            &mut self.source,
            self.config.frame_read_attempts,
            self.config.frame_retry_delay,
            interrupted,
        ) {
            Ok(frame) => frame,
            Err(CameraError::Interrupted) => return Ok(Some(ExitReason::Interrupted)),
            Err(e) => {
                tracing::warn!(error = %e, "failed to grab frame");
                eprintln!("\nError: Failed to grab frame from webcam");
                eprintln!("1. Make sure the camera is not being used by another application");
                eprintln!("2. Try unplugging and reconnecting the camera");
                eprintln!("3. Check your system's camera permissions");
                return Ok(None);
            }
        };

        let Some(image) = frame.to_image() else {
            tracing::warn!(
                width = frame.width,
                height = frame.height,
                len = frame.data.len(),
                "frame buffer does not match its dimensions"
            );
            return Ok(None);
        };

        self.surface.show(PREVIEW_WINDOW, &image)?;

        match self.surface.poll_key(KEY_POLL)? {
            Some(Key::Capture) => {
                let outcome = self.match_sequence(&image);
                tracing::debug!(?outcome, "match sequence finished");
                Ok(None)
            }
            Some(Key::Quit) => {
                println!("\nExiting...");
                Ok(Some(ExitReason::QuitKey))
            }
            Some(Key::Other) | None => Ok(None),
        }
    }

    /// Save `image`, search the reference directory and report the best match.
    ///
    /// The temporary capture is deleted before this returns, whatever the outcome.
    pub fn match_sequence(&mut self, image: &RgbImage) -> MatchOutcome {
        let capture = match TempCapture::save(image, &self.config.capture_dir, Local::now()) {
            Ok(capture) => capture,
            Err(e) => {
                tracing::warn!(error = %e, "failed to save capture");
                eprintln!("\nError saving image: {e}");
                eprintln!("Please check write permissions in the capture directory.");
                return MatchOutcome::SaveFailed(e);
            }
        };

        println!("\nImage captured and saved as {}", capture.display_name());
        println!("Processing image...");
        self.flash(CAPTURE_WINDOW, image, self.config.capture_preview);

        println!("Searching database for a match...");
        let db_dir = self.config.db_dir.clone();
        if !has_references(&db_dir) {
            eprintln!("Error: No database found or database is empty.");
            eprintln!(
                "Please add reference images to the '{}' folder.",
                db_dir.display()
            );
            return MatchOutcome::NoReferences;
        }

        let started = Instant::now();
        let result = self
            .matcher
            .find(capture.path(), &db_dir, &self.config.find_options());

        let outcome = match result {
            Ok(candidates) => match candidates.into_iter().next() {
                Some(best) => {
                    let report = MatchReport {
                        label: best.label(),
                        similarity: best.similarity(),
                        distance: best.distance,
                        identity: best.identity,
                        elapsed: started.elapsed(),
                    };
                    tracing::info!(
                        label = %report.label,
                        distance = report.distance,
                        identity = %report.identity.display(),
                        "match found"
                    );
                    println!("\nMatch found: {}", report.label);
                    println!("Similarity: {:.2}", report.similarity);
                    println!("Time taken: {:.2} seconds", report.elapsed.as_secs_f64());
                    self.show_reference(&report);
                    MatchOutcome::Matched(report)
                }
                None => {
                    println!("\nNo match found in the database.");
                    MatchOutcome::NoMatch
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "face search failed");
                eprintln!("\nError during face recognition: {e}");
                return MatchOutcome::MatcherFailed(e);
            }
        };

        println!("\nPress 'c' to try again or 'q' to quit");
        drop(capture);
        outcome
    }

    /// Show the matched reference image, if it decodes.
    fn show_reference(&mut self, report: &MatchReport) {
        match image::open(&report.identity) {
            Ok(img) => {
                let window = format!("Matched: {}", report.label);
                self.flash(&window, &img.to_rgb8(), self.config.match_preview);
            }
            Err(e) => {
                tracing::debug!(path = %report.identity.display(), error = %e, "cannot display reference image");
            }
        }
    }

    /// Show `image` in its own window for `duration`, then close the window.
    /// Keys pressed meanwhile are ignored.
    fn flash(&mut self, window: &str, image: &RgbImage, duration: Duration) {
        let shown = self
            .surface
            .show(window, image)
            .and_then(|()| self.surface.poll_key(duration))
            .and_then(|_| self.surface.close(window));
        if let Err(e) = shown {
            tracing::warn!(window, error = %e, "failed to display image");
        }
    }
}

fn print_banner() {
    println!("\nFace Recognition System");
    println!("----------------------");
    println!("1. Make sure you can see yourself in the camera window");
    println!("2. Press 'c' to capture an image");
    println!("3. Press 'q' to quit");
    println!("----------------------");
}
