mod dead_letters;
mod retry_queue;
