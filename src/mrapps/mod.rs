pub mod wc;
