mod mock;
mod txq;
