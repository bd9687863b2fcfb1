// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! In-process fake robot vision server for scenario tests.

#![allow(dead_code)]

use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use sota_vision_rs::{Classification, FaceClassifier, Result as VisionResult};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// What the fake server answers. Mutable while a test runs.
#[derive(Clone, Debug)]
pub struct Script {
    /// Header line sent for `GET_FRAME`; anything but `FRAME` has no body
    pub frame_header: String,
    pub metadata: String,
    pub image: Option<Vec<u8>>,
    /// Close the socket after this many metadata bytes of a 50-byte segment
    pub truncate_after: Option<usize>,
    pub photo: Option<Vec<u8>>,
    /// Commands answered with `ERR:<cmd>`
    pub rejected: Vec<String>,
    /// Read `GET_FRAME` but never answer it
    pub stall_frames: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            frame_header: "FRAME".into(),
            metadata: face_metadata(),
            image: Some(jpeg(64, 48)),
            truncate_after: None,
            photo: Some(jpeg(32, 32)),
            rejected: Vec::new(),
            stall_frames: false,
        }
    }
}

#[derive(Default)]
struct Shared {
    log: Mutex<Vec<String>>,
    frames: AtomicUsize,
    stalled: AtomicUsize,
    script: Mutex<Script>,
}

pub struct FakeRobot {
    pub addr: String,
    shared: Arc<Shared>,
}

impl FakeRobot {
    pub fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let shared = Arc::new(Shared {
            script: Mutex::new(script),
            ..Default::default()
        });

        let server = shared.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => serve(stream, &server),
                    Err(_) => break,
                }
            }
        });

        Self { addr, shared }
    }

    /// Commands received so far, oldest first.
    pub fn log(&self) -> Vec<String> {
        self.shared.log.lock().unwrap().clone()
    }

    pub fn frame_requests(&self) -> usize {
        self.shared.frames.load(Ordering::SeqCst)
    }

    /// `GET_FRAME` requests left unanswered.
    pub fn stalled_frames(&self) -> usize {
        self.shared.stalled.load(Ordering::SeqCst)
    }

    pub fn update(&self, f: impl FnOnce(&mut Script)) {
        f(&mut self.shared.script.lock().unwrap());
    }
}

fn serve(stream: TcpStream, shared: &Shared) {
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut out = stream;
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let cmd = line.trim().to_string();
        shared.log.lock().unwrap().push(cmd.clone());
        let script = shared.script.lock().unwrap().clone();

        if script.rejected.contains(&cmd) {
            let _ = writeln!(out, "ERR:{}", cmd);
            continue;
        }

        let ok = match cmd.as_str() {
            "GET_FRAME" => {
                shared.frames.fetch_add(1, Ordering::SeqCst);
                if script.stall_frames {
                    shared.stalled.fetch_add(1, Ordering::SeqCst);
                    continue;
                }
                if let Some(n) = script.truncate_after {
                    let _ = out.write_all(b"FRAME\n");
                    let _ = out.write_all(&50i32.to_be_bytes());
                    let _ = out.write_all(&vec![b'{'; n]);
                    let _ = out.flush();
                    let _ = out.shutdown(std::net::Shutdown::Both);
                    return;
                }
                write_frame(&mut out, &script)
            }
            "TAKE_PHOTO" => {
                let photo = script.photo.unwrap_or_default();
                out.write_all(b"PHOTO\n")
                    .and_then(|_| out.write_all(&(photo.len() as i32).to_be_bytes()))
                    .and_then(|_| out.write_all(&photo))
            }
            "STATUS" => writeln!(
                out,
                r#"STATUS:{{"tracking":true,"pfagrEnabled":false,"cameraReady":true,"robotConnected":true}}"#
            ),
            "QUIT" => {
                let _ = writeln!(out, "OK:BYE");
                return;
            }
            other => writeln!(out, "OK:{}", other),
        };
        if ok.is_err() {
            return;
        }
    }
}

fn write_frame(out: &mut TcpStream, script: &Script) -> std::io::Result<()> {
    writeln!(out, "{}", script.frame_header)?;
    if script.frame_header != "FRAME" {
        return Ok(());
    }
    let image = script.image.clone().unwrap_or_default();
    let mut buf = Vec::new();
    buf.extend_from_slice(&(script.metadata.len() as i32).to_be_bytes());
    buf.extend_from_slice(script.metadata.as_bytes());
    buf.extend_from_slice(&(image.len() as i32).to_be_bytes());
    buf.extend_from_slice(&image);
    out.write_all(&buf)
}

pub fn face_metadata() -> String {
    r#"{"tracking":true,"faceDetected":true,"faceNum":1,"faces":[{"x":16,"y":12,"w":20,"h":20}],"smile":30,"fps":15.0}"#.into()
}

pub fn no_face_metadata() -> String {
    r#"{"tracking":true,"faceDetected":false,"faceNum":0,"faces":[],"fps":15.0}"#.into()
}

pub fn jpeg(w: u32, h: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(w, h, Rgb([180, 140, 120]));
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, 80)
        .encode_image(&img)
        .unwrap();
    out
}

/// Classifier that answers instantly and counts calls.
#[derive(Default)]
pub struct CountingClassifier {
    pub calls: AtomicUsize,
}

impl CountingClassifier {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FaceClassifier for CountingClassifier {
    fn classify(&self, _face: &RgbImage) -> VisionResult<Classification> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scores: BTreeMap<String, f32> = [("asian".to_string(), 87.0), ("white".to_string(), 9.0)]
            .into_iter()
            .collect();
        Ok(Classification::from_scores(scores).unwrap())
    }
}

pub fn wait_until(what: &str, mut f: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}
