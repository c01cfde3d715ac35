//! Script-visible drawing objects. Pixels are plain RGBA8; decoding image
//! files and rasterizing glyphs are left to the embedder.

pub mod card;
pub mod colour;
pub mod font;
pub mod rect;
pub mod surface;
pub mod text;

pub use card::{DeckCard, DeckImage};
pub use colour::{Colour, DeckColour};
pub use font::DeckFont;
pub use rect::{DeckRect, Rect};
pub use surface::Surface;
pub use text::DeckText;
