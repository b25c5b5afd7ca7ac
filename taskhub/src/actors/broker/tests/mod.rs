mod resolution;
mod support;
