//! Embedded device kernels
//!
//! The `kernels32` image holds the 32-bit float kernels every
//! [`Handle`](crate::Handle) loads. `build.rs` points
//! `CUDAVEC_KERNELS32_PTX` at either freshly compiled PTX (feature `cuda`
//! with nvcc available) or the bundled `kernels32.ptx`.

/// PTX image of the 32-bit float kernels
pub static KERNELS32: KernelImage =
    KernelImage::new("kernels32", include_str!(env!("CUDAVEC_KERNELS32_PTX")));

/// A compiled kernel image embedded in the binary.
///
/// The text format is owned by the device toolchain; this type only reads
/// the header and the entry-point names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelImage {
    name: &'static str,
    ptx: &'static str,
}

impl KernelImage {
    /// Wrap PTX text
    pub const fn new(name: &'static str, ptx: &'static str) -> Self {
        Self { name, ptx }
    }

    /// Image name, used in logs and errors
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The PTX text
    pub fn ptx(&self) -> &'static str {
        self.ptx
    }

    /// The `.version` directive, e.g. `"6.0"`
    pub fn version(&self) -> Option<&'static str> {
        self.code_lines()
            .find_map(|line| line.strip_prefix(".version"))
            .map(str::trim)
    }

    /// Names of every `.entry` in declaration order
    pub fn entries(&self) -> Vec<&'static str> {
        self.code_lines()
            .filter_map(|line| {
                let (_, rest) = line.split_once(".entry")?;
                let name = rest.trim_start().split(['(', ' ', '\t']).next()?;
                (!name.is_empty()).then_some(name)
            })
            .collect()
    }

    /// Whether the image declares an entry called `name`
    pub fn contains(&self, name: &str) -> bool {
        self.entries().contains(&name)
    }

    fn code_lines(&self) -> impl Iterator<Item = &'static str> + use<> {
        let ptx: &'static str = self.ptx;
        ptx.lines()
            .map(str::trim)
            .filter(|line| !line.starts_with("//"))
    }
}

/// A kernel image loaded into a context.
///
/// Entry names are taken from the image at load time so lookups do not need
/// the device.
#[derive(Debug)]
pub struct KernelModule<M> {
    image: &'static KernelImage,
    entries: Vec<&'static str>,
    module: M,
}

impl<M> KernelModule<M> {
    pub(crate) fn new(image: &'static KernelImage, module: M) -> Self {
        Self {
            image,
            entries: image.entries(),
            module,
        }
    }

    /// The image this module was loaded from
    pub fn image(&self) -> &'static KernelImage {
        self.image
    }

    /// Entry-point names
    pub fn entries(&self) -> &[&'static str] {
        &self.entries
    }

    /// Whether the module has an entry called `name`
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains(&name)
    }

    /// The driver's module object
    pub fn module(&self) -> &M {
        &self.module
    }
}
