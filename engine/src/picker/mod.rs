mod advisor;
mod partial_piece;

pub use advisor::PieceAdvisor;
pub use partial_piece::{BlockState, PartialPiece};
