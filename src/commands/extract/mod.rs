mod acquisition;
mod additional_therapy;
mod assemble;
mod blood_tests;
mod classify;
mod cycle_info;
mod drug_table;
mod metadata;
mod normalize;
mod oral_dose;
mod pipeline;
mod run;
mod segment;
mod vocabulary;

pub use run::run;
