//! cinch-core: a PE (Portable Executable) executable-packer engine.
//!
//! The engine transforms a well-formed PE32 or PE32+ image into a
//! smaller, self-extracting image, and performs the inverse transform.
//! It parses and validates headers and data-directory blobs, rewrites
//! imports, relocations, resources, TLS, load-config and exports into a
//! compressor-friendly form, lays out the packed file, and rebuilds the
//! original image on unpack.
//!
//! The compression codec, the loader stub and the code filter are
//! collaborators behind the [`codec::Compressor`], [`stub::StubLinker`]
//! and [`filter::Filter`] contracts; default implementations are
//! provided.

pub mod buffer;
pub mod codec;
pub mod config;
pub mod error;
pub mod export;
pub mod filter;
pub mod imports;
pub mod interval;
pub mod io;
pub mod linker;
pub mod loadconf;
pub mod packer;
pub mod pe;
pub mod reloc;
pub mod resource;
pub mod stub;
pub mod tls;
pub mod unpacker;
pub mod util;

pub use codec::{Compressor, XzCodec};
pub use config::{PackConfig, Tristate};
pub use error::{PeError, Result};
pub use io::{FileSink, FileSource, InputSource, MemSink, MemSource, OutputSink};
pub use packer::{pack, PackOutcome};
pub use stub::{BaselineStub, StubLinker};
pub use unpacker::{unpack, UnpackOutcome};
