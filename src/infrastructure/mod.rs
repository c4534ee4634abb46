pub mod paper_exchange;
