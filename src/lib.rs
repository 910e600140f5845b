//! # gong
//!
//! A scheduled backup utility: enumerate sources, archive them through a
//! compress/encrypt pipeline, store the result at a destination, verify it
//! and apply retention.
//!
//! ## Features
//!
//! - **Scheduled Backups**: Cron-based automation with one active run per job
//! - **Multiple Sources**: Directory trees with exclude globs and SQLite databases
//! - **Incremental Backups**: Content fingerprints against the previous manifest
//! - **Compression**: Gzip, LZ4 or XZ
//! - **Encryption**: Age, with x25519 identities or passphrases
//! - **Destinations**: Local disk, S3-compatible stores and Google Cloud Storage
//! - **Retention Management**: Daily, weekly and monthly buckets with a max age
//!
//! ## Quick Start
//!
//! ```no_run
//! use gong::backup::backup_config::Config;
//! use gong::backup::engine::Engine;
//!
//! let config = Config::load("config.yml")?;
//! let engine = Engine::new(config)?;
//! let run = engine.run_job("daily-etc")?;
//! println!("{} ended {}", run.id, run.state);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
