pub mod backup_config;
pub mod compress;
pub mod destination;
pub mod differ;
pub mod digest;
pub mod encrypt;
pub mod engine;
pub mod file_ext;
pub mod finish;
pub mod history;
pub mod manifest;
pub mod pipeline;
pub mod redacted;
pub mod result_error;
pub mod retention;
pub mod run;
pub mod scheduler;
pub mod source;
pub mod validate;
pub mod verify;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
