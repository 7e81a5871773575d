mod caching;
mod compile;
mod utils;
