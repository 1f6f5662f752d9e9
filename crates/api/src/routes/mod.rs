pub mod health;
pub mod mp3ify;
pub mod stream;
