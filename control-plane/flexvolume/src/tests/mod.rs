mod fakes;
mod rpc;
