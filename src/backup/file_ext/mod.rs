/// Extension appended to archive keys for one pipeline stage (`gz`, `age`, ...).
pub trait FileExtProvider {
    fn file_ext(&self) -> Option<&'static str>;
}
